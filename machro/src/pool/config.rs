use std::collections::HashMap;

use super::Database;
use crate::{
    common::ByteStr,
    connection::{self, Config},
};

/// Default total prepared statements a [`Conn`][crate::Conn] keeps for reuse.
pub const DEFAULT_CACHE_CAP: usize = 128;

/// Default prepared statements kept per query text.
pub const DEFAULT_CACHE_PER_KEY: usize = 8;

/// When a [`Conn`][crate::Conn] keeps prepared statements for reuse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReusePolicy {
    Off,
    On,
    /// Reuse queries starting with `SELECT`, `WITH`, `INSERT`, `UPDATE`,
    /// `DELETE`, `MERGE`, `UPSERT` or `REPLACE`.
    #[default]
    Auto,
}

impl ReusePolicy {
    /// Read `MACHCLI2_QUERY_STMT_REUSE` then `MACHCLI2_QUERY_STMT_REUSE_MODE`.
    ///
    /// The legacy switch wins when it holds a recognized value.
    pub fn from_env() -> ReusePolicy {
        let legacy = std::env::var("MACHCLI2_QUERY_STMT_REUSE").unwrap_or_default();
        let mode = std::env::var("MACHCLI2_QUERY_STMT_REUSE_MODE").unwrap_or_default();
        Self::resolve(&legacy, &mode)
    }

    fn resolve(legacy: &str, mode: &str) -> ReusePolicy {
        match legacy.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => return ReusePolicy::On,
            "0" | "false" | "off" | "no" => return ReusePolicy::Off,
            _ => {}
        }
        match mode.trim().to_ascii_lowercase().as_str() {
            "on" => ReusePolicy::On,
            "off" => ReusePolicy::Off,
            _ => ReusePolicy::Auto,
        }
    }

    /// Returns `true` if statements of `query` are kept after use.
    pub fn reuses(self, query: &str) -> bool {
        match self {
            ReusePolicy::On => true,
            ReusePolicy::Off => false,
            ReusePolicy::Auto => matches!(
                query_head(query).as_str(),
                "SELECT" | "WITH" | "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "UPSERT" | "REPLACE"
            ),
        }
    }
}

/// First word of `query`, uppercased.
pub(crate) fn query_head(query: &str) -> String {
    query.split_whitespace().next().unwrap_or_default().to_ascii_uppercase()
}

/// [`Database`] configuration builder.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub(crate) host: ByteStr,
    pub(crate) port: u16,
    pub(crate) alternative: Option<(ByteStr, u16)>,
    pub(crate) max_open_conn: i64,
    pub(crate) max_open_conn_factor: f64,
    pub(crate) trust_users: HashMap<String, String>,
    pub(crate) reuse: ReusePolicy,
    pub(crate) cache_cap: usize,
    pub(crate) cache_per_key: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: ByteStr::from_static(connection::DEFAULT_HOST),
            port: connection::DEFAULT_PORT,
            alternative: None,
            max_open_conn: 0,
            max_open_conn_factor: 1.5,
            trust_users: HashMap::new(),
            reuse: ReusePolicy::Auto,
            cache_cap: DEFAULT_CACHE_CAP,
            cache_per_key: DEFAULT_CACHE_PER_KEY,
        }
    }
}

impl PoolConfig {
    pub fn new() -> PoolConfig {
        Self::default()
    }

    /// Endpoint from [`Config::from_env`], reuse policy from [`ReusePolicy::from_env`].
    pub fn from_env() -> PoolConfig {
        let conn = Config::from_env();
        let mut endpoints = conn.endpoints().map(|(host, port)| (ByteStr::copy_from_str(host), port));
        let (host, port) = endpoints.next().unwrap_or_else(|| {
            (ByteStr::from_static(connection::DEFAULT_HOST), connection::DEFAULT_PORT)
        });

        Self {
            host,
            port,
            alternative: endpoints.next(),
            reuse: ReusePolicy::from_env(),
            ..Self::default()
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = ByteStr::from(Into::<String>::into(host));
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Endpoint tried when the primary one is unreachable.
    pub fn alternative(mut self, host: impl Into<String>, port: u16) -> Self {
        self.alternative = Some((ByteStr::from(Into::<String>::into(host)), port));
        self
    }

    /// Maximum open connections.
    ///
    /// - `< 0`: unlimited
    /// - `0`: available parallelism times [`max_open_conn_factor`][Self::max_open_conn_factor]
    /// - `> 0`: the given limit
    pub fn max_open_conn(mut self, value: i64) -> Self {
        self.max_open_conn = value;
        self
    }

    /// Factor used when max open connections is `0`, non positive resets to `1.5`.
    pub fn max_open_conn_factor(mut self, value: f64) -> Self {
        self.max_open_conn_factor = if value > 0.0 { value } else { 1.5 };
        self
    }

    /// Register a user that can connect without giving its password.
    pub fn trust_user(mut self, user: &str, password: impl Into<String>) -> Self {
        self.trust_users.insert(user.to_ascii_uppercase(), password.into());
        self
    }

    pub fn reuse_policy(mut self, policy: ReusePolicy) -> Self {
        self.reuse = policy;
        self
    }

    /// Statement reuse cache capacity, total and per query text.
    pub fn cache_capacity(mut self, total: usize, per_key: usize) -> Self {
        self.cache_cap = total;
        self.cache_per_key = per_key;
        self
    }

    /// Create the [`Database`], no connection is made yet.
    pub fn open(self) -> Database {
        Database::new(self)
    }

    /// Resolve max open connections to a limit, [`None`] is unlimited.
    pub(crate) fn resolve_limit(&self, value: i64) -> Option<usize> {
        match value {
            n if n < 0 => None,
            0 => {
                let cpus = std::thread::available_parallelism().map(|e| e.get()).unwrap_or(1);
                Some(((cpus as f64) * self.max_open_conn_factor).ceil().max(1.0) as usize)
            }
            n => Some(n as usize),
        }
    }
}
