//! Environment, connection and statement handles.
//!
//! Handles own the protocol state between calls and remember the last error of
//! every operation, which [`error_with_cause`] turns into the reported error.
//!
//! Ownership is nested: an [`Env`] tracks its open [`ConnHandle`]s, and a
//! [`StmtHandle`] keeps its connection alive until freed.
use std::sync::Mutex;

use crate::{Error, Result, error::StatusError};

mod env;
mod conn;
mod stmt;
mod append;

pub use env::Env;
pub use conn::ConnHandle;
pub use stmt::StmtHandle;
pub use append::AppendCount;

/// Last error of a shared handle.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot(Mutex<Option<StatusError>>);

impl ErrorSlot {
    /// Remember the error of `result`, or clear on success.
    pub fn record<T>(&self, result: &Result<T>) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *slot = result.as_ref().err().map(Error::status);
    }

    pub fn get(&self) -> Option<StatusError> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A handle whose last error can be queried.
#[derive(Clone, Copy, Debug)]
pub enum HandleRef<'a> {
    Env(&'a Env),
    Conn(&'a ConnHandle),
    Stmt(&'a StmtHandle),
}

impl HandleRef<'_> {
    /// Last error recorded on the handle.
    pub fn error(&self) -> Option<StatusError> {
        match self {
            HandleRef::Env(e) => e.error(),
            HandleRef::Conn(c) => c.error(),
            HandleRef::Stmt(s) => s.error(),
        }
    }
}

impl<'a> From<&'a Env> for HandleRef<'a> {
    fn from(value: &'a Env) -> Self {
        HandleRef::Env(value)
    }
}

impl<'a> From<&'a ConnHandle> for HandleRef<'a> {
    fn from(value: &'a ConnHandle) -> Self {
        HandleRef::Conn(value)
    }
}

impl<'a> From<&'a StmtHandle> for HandleRef<'a> {
    fn from(value: &'a StmtHandle) -> Self {
        HandleRef::Stmt(value)
    }
}

/// Attach the handle last error to `cause`.
///
/// Client errors read `MACHCLI {message}, {cause}`, server errors read
/// `MACHCLI-ERR-{code}, {message}`. Without a recorded error the cause is
/// returned as is.
pub fn error_with_cause<'a>(handle: impl Into<HandleRef<'a>>, cause: Error) -> Error {
    match handle.into().error() {
        Some(st) if st.is_server() => cause.with_context(format!("MACHCLI-ERR-{}", st.code())),
        Some(st) => cause.with_context(format!("MACHCLI {}", st.message())),
        None => cause,
    }
}
