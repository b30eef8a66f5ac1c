//! Machbase connection configuration.
use std::{borrow::Cow, env::var, fmt, time::Duration};

use crate::common::ByteStr;

pub(crate) const DEFAULT_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_PORT: u16 = 5656;
pub(crate) const DEFAULT_FETCH_ROWS: i64 = 1000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Machbase connection config.
///
/// The connection string is `;` separated `KEY=VALUE` pairs:
///
/// ```text
/// SERVER=127.0.0.1;PORT_NO=5656;UID=SYS;PWD=MANAGER;CONNTYPE=1
/// ```
///
/// Keys are case insensitive, the first value of a key wins and unknown keys
/// are ignored.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) host: ByteStr,
    pub(crate) port: u16,
    pub(crate) alternatives: Vec<(ByteStr, u16)>,
    pub(crate) user: ByteStr,
    pub(crate) pass: ByteStr,
    pub(crate) fetch_rows: i64,
    pub(crate) connect_timeout: Duration,
    pub(crate) query_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: ByteStr::from_static(DEFAULT_HOST),
            port: DEFAULT_PORT,
            alternatives: vec![],
            user: ByteStr::default(),
            pass: ByteStr::default(),
            fetch_rows: DEFAULT_FETCH_ROWS,
            connect_timeout: CONNECT_TIMEOUT,
            query_timeout: QUERY_TIMEOUT,
        }
    }
}

impl Config {
    /// Retrieve configuration from environment variable.
    ///
    /// It reads:
    /// - `MACHBASE_SERVER`
    /// - `MACHBASE_PORT`
    /// - `MACHBASE_USER`
    /// - `MACHBASE_PASSWORD`
    /// - `MACHBASE_FETCH_ROWS`
    ///
    /// Additionally, it also read `MACHBASE_CONN` connection string to provide
    /// missing value from previous variables before fallback to default value.
    pub fn from_env() -> Config {
        let conn = var("MACHBASE_CONN").ok().and_then(|e| Config::parse(&e).ok());
        let def = Config::default();

        macro_rules! env {
            ($name:literal,$or:ident) => {
                match (var($name).ok().and_then(|e| e.parse().ok()), conn.as_ref()) {
                    (Some(ok), _) => ok,
                    (None, Some(e)) => e.$or.clone(),
                    (None, None) => def.$or.clone(),
                }
            };
        }

        let host = env!("MACHBASE_SERVER", host);
        let port = env!("MACHBASE_PORT", port);
        let user = env!("MACHBASE_USER", user);
        let pass = env!("MACHBASE_PASSWORD", pass);
        let fetch_rows = match env!("MACHBASE_FETCH_ROWS", fetch_rows) {
            n if n > 0 => n,
            _ => DEFAULT_FETCH_ROWS,
        };
        let alternatives = conn.map(|e| e.alternatives).unwrap_or_default();

        Self { host, port, alternatives, user, pass, fetch_rows, ..def }
    }

    /// Parse config from connection string.
    pub fn parse(conn: &str) -> Result<Config, ParseError> {
        let mut server = None;
        let mut port = None;
        let mut user = None;
        let mut pass = None;
        let mut fetch_rows = None;
        let mut alternatives = None;

        for pair in conn.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim();

            let slot = match key.trim().to_ascii_uppercase().as_str() {
                "SERVER" => &mut server,
                "PORT_NO" => &mut port,
                "UID" => &mut user,
                "PWD" => &mut pass,
                "FETCH_ROWS" => &mut fetch_rows,
                "ALTERNATIVE_SERVERS" => &mut alternatives,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value);
            }
        }

        let mut config = Config::default();

        if let Some(host) = server.filter(|e| !e.is_empty()) {
            config.host = ByteStr::copy_from_str(host);
        }
        if let Some(port) = port.filter(|e| !e.is_empty()) {
            config.port = port.parse().map_err(|_| ParseError::new("invalid PORT_NO"))?;
        }
        if let Some(rows) = fetch_rows.filter(|e| !e.is_empty()) {
            config.fetch_rows = match rows.parse() {
                Ok(n) if n > 0 => n,
                _ => return Err(ParseError::new("invalid FETCH_ROWS")),
            };
        }

        config.user = user.map(ByteStr::copy_from_str).unwrap_or_default();
        config.pass = pass.map(ByteStr::copy_from_str).unwrap_or_default();
        config.alternatives = alternatives.map(parse_alternatives).unwrap_or_default();

        Ok(config)
    }

    /// Set the user id.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = ByteStr::from(Into::<String>::into(user));
        self
    }

    /// Set the password.
    pub fn password(mut self, pass: impl Into<String>) -> Self {
        self.pass = ByteStr::from(Into::<String>::into(pass));
        self
    }

    /// Set the rows requested per fetch.
    pub fn fetch_rows(mut self, rows: i64) -> Self {
        if rows > 0 {
            self.fetch_rows = rows;
        }
        self
    }

    /// Set the per request read and write deadline.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Set the deadline of tcp connect and handshake, per endpoint.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn get_user(&self) -> &str {
        &self.user
    }

    /// Primary endpoint followed by the alternatives, in declaration order.
    pub fn endpoints(&self) -> impl Iterator<Item = (&str, u16)> {
        std::iter::once((self.host.as_str(), self.port))
            .chain(self.alternatives.iter().map(|(h, p)| (h.as_str(), *p)))
    }
}

/// `host:port[,host:port...]`, invalid entries are skipped.
fn parse_alternatives(value: &str) -> Vec<(ByteStr, u16)> {
    value
        .split(',')
        .filter_map(|e| {
            let (host, port) = e.trim().rsplit_once(':')?;
            let port = port.trim().parse().ok()?;
            let host = host.trim();
            (!host.is_empty()).then(|| (ByteStr::copy_from_str(host), port))
        })
        .collect()
}

impl std::str::FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Error when parsing connection string.
pub struct ParseError {
    pub(crate) reason: Cow<'static, str>,
}

impl ParseError {
    pub(crate) fn new(reason: impl Into<Cow<'static, str>>) -> ParseError {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for ParseError { }

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            return f.write_str(&self.reason)
        }
        write!(f, "failed to parse connection string: {}", self.reason)
    }
}

impl fmt::Debug for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
