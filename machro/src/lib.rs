//! Machbase Native Protocol Client
//!
//! # Examples
//!
//! Query:
//!
//! ```no_run
//! use machro::{Auth, PoolConfig};
//!
//! # async fn app() -> machro::Result<()> {
//! let db = PoolConfig::new().host("127.0.0.1").port(5656).open();
//! let mut conn = db.connect(Auth::password("sys", "manager")).await?;
//!
//! let row = conn.query_row("SELECT NAME, VALUE FROM TAG WHERE NAME = ?", &["sensor-1".into()]).await?;
//! let (name, value) = row.decode::<(String, f64)>()?;
//!
//! let mut rows = conn.query("SELECT NAME, VALUE FROM TAG", &[]).await?;
//! while let Some(row) = rows.next() {
//!     let value = row.try_get::<_, f64>("VALUE")?;
//! }
//! rows.close().await?;
//!
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Append:
//!
//! ```no_run
//! use machro::{Auth, Database, Value};
//!
//! # async fn app() -> machro::Result<()> {
//! let db = Database::from_env();
//! let mut conn = db.connect(Auth::password("sys", "manager")).await?;
//!
//! let mut appender = conn.appender("TAG").await?;
//! for i in 0..1000i64 {
//!     appender.append(&["sensor-1".into(), Value::DateTime(i * 1_000_000), (i as f64).into()]).await?;
//! }
//! let (count, result) = appender.close().await;
//! result?;
//! assert_eq!(count.success, 1000);
//!
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
mod net;
mod ext;

// Protocol
pub mod protocol;
mod connection;

// Encoding
mod value;
mod bind;
mod append;
pub mod row;
pub mod types;

// Handle
pub mod handle;

// Client
pub mod pool;
mod conn;
mod statement;
mod appender;
mod result;

mod error;


pub use value::Value;
pub use bind::EncodeError;
pub use row::{Row, FromRow, Decode, DecodeError};

pub use connection::{Config, ParseError};
pub use handle::{Env, ConnHandle, StmtHandle, AppendCount};
pub use pool::{Database, PoolConfig, ReusePolicy, Auth};
pub use conn::Conn;
pub use statement::PreparedStmt;
pub use appender::{Appender, TableType, TableColumn};
pub use result::{ExecResult, QueryRow, Rows};
pub use error::{Error, ErrorKind, Result, StatusError};
