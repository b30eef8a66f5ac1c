//! Database connection pooling.
use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    task::{Context, Poll, ready},
    time::{Duration, Instant},
};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::{
    Conn, Result,
    common::{logged, verbose},
    conn::StmtCache,
    error::StatusError,
    handle::{Env, error_with_cause},
};

mod config;

pub use config::{DEFAULT_CACHE_CAP, DEFAULT_CACHE_PER_KEY, PoolConfig, ReusePolicy};
pub(crate) use config::query_head;

/// Credentials used to open a [`Conn`].
#[derive(Clone, Copy, Debug)]
pub enum Auth<'a> {
    Password { user: &'a str, password: &'a str },
    /// A user registered with [`Database::set_trust_user`], or one that
    /// connected with a password before.
    TrustUser(&'a str),
}

impl<'a> Auth<'a> {
    pub fn password(user: &'a str, password: &'a str) -> Auth<'a> {
        Auth::Password { user, password }
    }

    pub fn trust(user: &'a str) -> Auth<'a> {
        Auth::TrustUser(user)
    }
}

/// Database connection pool.
///
/// Opening a [`Conn`] takes one permit out of the limit configured in
/// [`PoolConfig::max_open_conn`], closing the [`Conn`] gives it back.
///
/// Cloning returns another handle to the same pool.
#[derive(Clone, Debug)]
pub struct Database {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    config: PoolConfig,
    env: Env,
    trust_users: RwLock<HashMap<String, String>>,
    limit: RwLock<Option<Limit>>,
}

#[derive(Clone, Debug)]
struct Limit {
    semaphore: Arc<Semaphore>,
    cap: usize,
}

impl Database {
    /// Create [`Database`] from [`PoolConfig::from_env`].
    pub fn from_env() -> Database {
        PoolConfig::from_env().open()
    }

    pub(crate) fn new(config: PoolConfig) -> Database {
        let limit = config.resolve_limit(config.max_open_conn).map(Limit::new);
        let trust_users = RwLock::new(config.trust_users.clone());
        Self {
            shared: Arc::new(Shared { env: Env::new(), trust_users, limit: RwLock::new(limit), config }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Returns the open connection limit and the permits left, `(-1, -1)` when unlimited.
    pub fn max_open_conns(&self) -> (i64, i64) {
        match &*self.shared.read_limit() {
            Some(limit) => (limit.cap as i64, limit.semaphore.available_permits() as i64),
            None => (-1, -1),
        }
    }

    /// Replace the open connection limit, see [`PoolConfig::max_open_conn`].
    ///
    /// Connections opened before keep their permit of the previous limit.
    pub fn set_max_open_conns(&self, value: i64) {
        let limit = self.shared.config.resolve_limit(value);
        let mut current = self.shared.write_limit();
        if current.as_ref().map(|e| e.cap) == limit {
            return;
        }
        *current = limit.map(Limit::new);
    }

    /// Open a connection, waits while the pool is at its limit.
    pub async fn connect(&self, auth: Auth<'_>) -> Result<Conn> {
        self.connect_until(auth, std::future::pending::<()>()).await
    }

    /// Open a connection, giving up waiting for a permit once `cancel` completes.
    pub async fn connect_until<F: Future>(&self, auth: Auth<'_>, cancel: F) -> Result<Conn> {
        let (user, password) = self.credentials(auth)?;

        let limit = self.shared.read_limit().clone();
        let permit = match limit {
            Some(limit) => {
                let acquire = Acquire { permit: Box::pin(limit.semaphore.acquire_owned()), cancel };
                Some(acquire.await?)
            }
            None => None,
        };

        let conn_str = self.connection_string(&user, &password);
        let handle = match self.shared.env.connect(&conn_str).await {
            Ok(ok) => ok,
            Err(err) => return Err(error_with_cause(&self.shared.env, err)),
        };
        verbose!(session = handle.session_id(), user = %user, "Connected");

        self.set_trust_user(&user, &password);

        let config = &self.shared.config;
        let cache = StmtCache::new(config.reuse, config.cache_cap, config.cache_per_key);
        Ok(Conn::new(handle, user.to_ascii_uppercase(), cache, permit))
    }

    fn credentials(&self, auth: Auth<'_>) -> Result<(String, String)> {
        match auth {
            Auth::Password { user, password } => Ok((user.to_owned(), password.to_owned())),
            Auth::TrustUser(user) => {
                let user = user.to_ascii_uppercase();
                let users = self.shared.trust_users.read().unwrap_or_else(|e| e.into_inner());
                match users.get(&user) {
                    Some(password) => Ok((user, password.clone())),
                    None => Err(StatusError::client("trust user not found").into()),
                }
            }
        }
    }

    pub(crate) fn connection_string(&self, user: &str, password: &str) -> String {
        let config = &self.shared.config;
        let mut conn = format!(
            "SERVER={};PORT_NO={};UID={};PWD={};CONNTYPE=1",
            config.host,
            config.port,
            user.to_ascii_uppercase(),
            password.to_ascii_uppercase(),
        );
        if let Some((host, port)) = config.alternative.as_ref().filter(|e| !e.0.is_empty() && e.1 != 0) {
            conn.push_str(&format!(";ALTERNATIVE_SERVERS={host}:{port}"));
        }
        conn
    }

    /// Connect and disconnect with any trust user, returns the time it took.
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        let user = {
            let users = self.shared.trust_users.read().unwrap_or_else(|e| e.into_inner());
            users.iter().next().map(|(u, p)| (u.clone(), p.clone()))
        };
        let Some((user, password)) = user else {
            return Err(StatusError::client("ping requires at least one trust user").into());
        };

        let mut conn = self.connect(Auth::password(&user, &password)).await?;
        conn.close().await?;
        Ok(start.elapsed())
    }

    /// Register a user that can connect with [`Auth::TrustUser`].
    pub fn set_trust_user(&self, user: &str, password: &str) {
        let mut users = self.shared.trust_users.write().unwrap_or_else(|e| e.into_inner());
        users.insert(user.to_ascii_uppercase(), password.to_owned());
    }

    /// Check credentials by connecting.
    ///
    /// Returns `(false, reason)` when the connection is refused.
    pub async fn user_auth(&self, user: &str, password: &str) -> Result<(bool, &'static str)> {
        match self.connect(Auth::password(user, password)).await {
            Ok(mut conn) => {
                conn.close().await?;
                Ok((true, ""))
            }
            Err(_err) => {
                logged!(debug, "authentication of {user} failed: {_err}");
                Ok((false, "invalid username or password"))
            }
        }
    }

    /// Disconnect every connection, subsequent connect fails.
    pub async fn close(&self) -> Result<()> {
        match self.shared.env.finalize().await {
            Ok(()) => Ok(()),
            Err(err) => Err(error_with_cause(&self.shared.env, err)),
        }
    }
}

impl Shared {
    fn read_limit(&self) -> RwLockReadGuard<'_, Option<Limit>> {
        self.limit.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_limit(&self) -> RwLockWriteGuard<'_, Option<Limit>> {
        self.limit.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Limit {
    fn new(cap: usize) -> Limit {
        Self { semaphore: Arc::new(Semaphore::new(cap)), cap }
    }
}

type PermitFuture = Pin<Box<dyn Future<Output = Result<OwnedSemaphorePermit, AcquireError>> + Send>>;

pin_project_lite::pin_project! {
    /// Race a pool permit against caller cancellation.
    struct Acquire<F> {
        permit: PermitFuture,
        #[pin]
        cancel: F,
    }
}

impl<F: Future> Future for Acquire<F> {
    type Output = Result<OwnedSemaphorePermit>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.project();

        if let Poll::Ready(result) = me.permit.as_mut().poll(cx) {
            return Poll::Ready(result.map_err(|_| StatusError::client("database closed").into()));
        }

        ready!(me.cancel.poll(cx));
        Poll::Ready(Err(StatusError::client("connect canceled").into()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::mock::{self, MockServer};

    fn database(server: &MockServer, max: i64) -> Database {
        PoolConfig::new()
            .port(server.port())
            .max_open_conn(max)
            .reuse_policy(ReusePolicy::Auto)
            .open()
    }

    #[test]
    fn connection_string() {
        let db = PoolConfig::new().host("10.0.0.1").port(15656).alternative("10.0.0.2", 5656).open();
        assert_eq!(
            db.connection_string("sys", "manager"),
            "SERVER=10.0.0.1;PORT_NO=15656;UID=SYS;PWD=MANAGER;CONNTYPE=1;ALTERNATIVE_SERVERS=10.0.0.2:5656"
        );

        let db = PoolConfig::new().max_open_conn(-1).open();
        assert_eq!(db.connection_string("a", "b"), "SERVER=127.0.0.1;PORT_NO=5656;UID=A;PWD=B;CONNTYPE=1");
        assert_eq!(db.max_open_conns(), (-1, -1));

        db.set_max_open_conns(3);
        assert_eq!(db.max_open_conns(), (3, 3));
    }

    #[tokio::test]
    async fn pool_blocks_at_capacity() {
        let server = MockServer::start(mock::default_reply).await;
        let db = database(&server, 1);
        let auth = Auth::password("sys", "manager");

        let mut a = db.connect(auth).await.unwrap();
        assert_eq!(db.max_open_conns(), (1, 0));

        let cancel = tokio::time::sleep(Duration::from_millis(50));
        let err = db.connect_until(auth, cancel).await.unwrap_err();
        assert_eq!(err.to_string(), "connect canceled");
        assert_eq!(db.max_open_conns(), (1, 0));

        a.close().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(db.max_open_conns(), (1, 1));

        let next = tokio::time::timeout(Duration::from_secs(1), db.connect(auth)).await;
        let mut b = next.unwrap().unwrap();
        assert_eq!(b.user(), "SYS");
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn trust_users_and_ping() {
        let server = MockServer::start(mock::default_reply).await;
        let db = database(&server, -1);

        let err = db.ping().await.unwrap_err();
        assert_eq!(err.to_string(), "ping requires at least one trust user");

        let err = db.connect(Auth::trust("sys")).await.unwrap_err();
        assert_eq!(err.to_string(), "trust user not found");

        let (ok, reason) = db.user_auth("sys", "manager").await.unwrap();
        assert!(ok);
        assert_eq!(reason, "");

        let mut conn = db.connect(Auth::trust("Sys")).await.unwrap();
        conn.close().await.unwrap();
        db.ping().await.unwrap();

        db.close().await.unwrap();
        let err = db.connect(Auth::trust("sys")).await.unwrap_err();
        assert!(err.to_string().starts_with("MACHCLI environment closed"));
    }

    #[tokio::test]
    async fn user_auth_refused() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let db = PoolConfig::new().port(port).max_open_conn(2).open();

        let (ok, reason) = db.user_auth("sys", "wrong").await.unwrap();
        assert!(!ok);
        assert_eq!(reason, "invalid username or password");
        assert_eq!(db.max_open_conns(), (2, 2));
    }
}
