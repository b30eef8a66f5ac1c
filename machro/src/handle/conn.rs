use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use super::{ErrorSlot, StmtHandle, env::EnvShared};
use crate::{Result, connection::Connection, error::StatusError};

/// An open connection of an [`Env`][super::Env].
///
/// Cloning returns another handle to the same connection.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    shared: Arc<ConnShared>,
}

#[derive(Debug)]
pub(crate) struct ConnShared {
    env: Weak<EnvShared>,
    key: u64,
    pub(crate) native: Connection,
    closed: AtomicBool,
    pub(crate) last_err: ErrorSlot,
}

impl ConnShared {
    pub(crate) fn new(env: Weak<EnvShared>, key: u64, native: Connection) -> ConnShared {
        Self { env, key, native, closed: AtomicBool::new(false), last_err: ErrorSlot::default() }
    }
}

impl ConnHandle {
    pub(crate) fn from_shared(shared: Arc<ConnShared>) -> ConnHandle {
        Self { shared }
    }

    pub(crate) fn native(&self) -> &Connection {
        &self.shared.native
    }

    pub(crate) fn record<T>(&self, result: &Result<T>) {
        self.shared.last_err.record(result);
    }

    /// Allocate a statement slot.
    ///
    /// With every id in use this fails with a client error, the connection
    /// stays usable and succeeds again once a statement is freed.
    pub fn alloc_stmt(&self) -> Result<StmtHandle> {
        let result = match self.is_closed() {
            true => Err(StatusError::client("connection closed").into()),
            false => self.shared.native.alloc_stmt_id(),
        };
        self.record(&result);
        Ok(StmtHandle::new(self.clone(), result?))
    }

    /// Close the connection, subsequent calls are no-op.
    pub async fn disconnect(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self.shared.native.close().await;
        self.record(&result);
        EnvShared::remove(&self.shared.env, self.shared.key);
        result
    }

    /// Returns `true` after disconnect, or when the byte stream broke.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.shared.native.is_closed()
    }

    /// Last error of an operation on this connection or its statements.
    pub fn error(&self) -> Option<StatusError> {
        self.shared.last_err.get()
    }

    pub fn session_id(&self) -> u64 {
        self.shared.native.session_id()
    }
}

#[cfg(test)]
mod test {
    use crate::{
        connection::mock::{self, MockServer},
        handle::Env,
    };

    #[tokio::test]
    async fn alloc_after_disconnect() {
        let server = MockServer::start(mock::default_reply).await;
        let env = Env::new();
        let conn = env.connect(&server.conn_string()).await.unwrap();

        let stmt = conn.alloc_stmt().unwrap();
        assert_eq!(stmt.id(), 0);
        assert_eq!(conn.session_id(), mock::SESSION_ID);

        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();

        let err = conn.alloc_stmt().unwrap_err();
        assert_eq!(err.to_string(), "connection closed");
        assert_eq!(conn.error().unwrap().message(), "connection closed");
    }
}
