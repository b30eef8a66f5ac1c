use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use super::{ConnHandle, ErrorSlot, conn::ConnShared};
use crate::{
    Result,
    common::logged,
    connection::{Config, Connection},
    error::StatusError,
};

/// Process resident root of every connection.
///
/// Cloning returns another handle to the same environment.
#[derive(Clone, Debug, Default)]
pub struct Env {
    shared: Arc<EnvShared>,
}

#[derive(Debug, Default)]
pub(crate) struct EnvShared {
    state: Mutex<EnvState>,
    next_key: AtomicU64,
    last_err: ErrorSlot,
}

#[derive(Debug, Default)]
struct EnvState {
    closed: bool,
    conns: HashMap<u64, Arc<ConnShared>>,
}

impl Env {
    pub fn new() -> Env {
        Env::default()
    }

    /// Open a connection described by a connection string.
    pub async fn connect(&self, conn: &str) -> Result<ConnHandle> {
        let result = self.connect_inner(conn).await;
        self.shared.last_err.record(&result);
        result
    }

    async fn connect_inner(&self, conn: &str) -> Result<ConnHandle> {
        let config = Config::parse(conn)?;
        let native = Connection::connect_with(config).await?;

        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(ConnShared::new(Arc::downgrade(&self.shared), key, native));

        let closed = {
            let mut state = self.shared.lock();
            if !state.closed {
                state.conns.insert(key, shared.clone());
            }
            state.closed
        };

        if closed {
            let _ = shared.native.close().await;
            return Err(StatusError::client("environment closed").into());
        }

        Ok(ConnHandle::from_shared(shared))
    }

    /// Disconnect every open connection, subsequent connect fails.
    ///
    /// Calling it again is a no-op.
    pub async fn finalize(&self) -> Result<()> {
        let conns = {
            let mut state = self.shared.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.conns)
        };

        for (_, conn) in conns {
            if let Err(_err) = ConnHandle::from_shared(conn).disconnect().await {
                logged!(warn, "failed to disconnect on finalize: {_err}");
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of connections still open.
    pub fn connections(&self) -> usize {
        self.shared.lock().conns.len()
    }

    /// Last error of [`connect`][Env::connect].
    pub fn error(&self) -> Option<StatusError> {
        self.shared.last_err.get()
    }
}

impl EnvShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, EnvState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget a disconnected connection.
    pub(crate) fn remove(env: &Weak<EnvShared>, key: u64) {
        if let Some(env) = env.upgrade() {
            env.lock().conns.remove(&key);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::mock::{self, MockServer};

    #[tokio::test]
    async fn connect_and_finalize() {
        let server = MockServer::start(mock::default_reply).await;
        let env = Env::new();

        let a = env.connect(&server.conn_string()).await.unwrap();
        let b = env.connect(&server.conn_string()).await.unwrap();
        assert_eq!(env.connections(), 2);
        assert!(env.error().is_none());

        b.disconnect().await.unwrap();
        assert_eq!(env.connections(), 1);

        env.finalize().await.unwrap();
        assert!(a.is_closed());
        assert_eq!(env.connections(), 0);

        let err = env.connect(&server.conn_string()).await.unwrap_err();
        assert_eq!(err.to_string(), "environment closed");
        assert_eq!(env.error().unwrap().message(), "environment closed");
    }

    #[tokio::test]
    async fn connect_errors_are_recorded() {
        let env = Env::new();
        let err = env.connect("PORT_NO=abc").await.unwrap_err();
        assert_eq!(format!("{err}"), "failed to parse connection string: invalid PORT_NO");
        assert_eq!(env.error().unwrap().code(), 0);
    }
}
