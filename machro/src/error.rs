//! `machro` error types.
use std::{backtrace::Backtrace, fmt, io, str::Utf8Error};

use crate::{
    bind::EncodeError,
    connection::ParseError,
    protocol::ProtocolError,
    row::{DecodeError, RowNotFound},
};

/// A specialized [`Result`] type for `machro` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `machro` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Project this error into the `(code, message)` pair a handle reports.
    ///
    /// Server errors keep their code, everything else is a client error.
    pub fn status(&self) -> StatusError {
        match &self.kind {
            ErrorKind::Status(e) => e.clone(),
            kind => StatusError::client(kind.to_string()),
        }
    }

    /// Returns `true` if the connection byte stream can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        match &self.kind {
            ErrorKind::Io(_) => true,
            ErrorKind::Protocol(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Returns `true` if a single row query found nothing.
    pub fn is_row_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::RowNotFound(_))
    }

    pub(crate) fn is_unexpected_protocol(&self) -> bool {
        matches!(self.kind, ErrorKind::Protocol(ProtocolError::Unexpected { .. }))
    }

    pub(crate) fn with_context(mut self, context: impl Into<String>) -> Error {
        self.context = context.into();
        self
    }
}

/// All possible error kind from `machro` library.
pub enum ErrorKind {
    Config(ParseError),
    Protocol(ProtocolError),
    Io(io::Error),
    Status(StatusError),
    Encode(EncodeError),
    Decode(DecodeError),
    RowNotFound(RowNotFound),
    Utf8(Utf8Error),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<std::io::Error>e => ErrorKind::Io(e));
from!(<StatusError>e => ErrorKind::Status(e));
from!(<EncodeError>e => ErrorKind::Encode(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<RowNotFound>e => ErrorKind::RowNotFound(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, self.context.is_empty()) {
            // server errors replace the cause with the server message
            (ErrorKind::Status(e), false) if e.is_server() => {
                write!(f, "{}, {}", self.context, e.message)?
            }
            (kind, false) => write!(f, "{}, {kind}", self.context)?,
            (kind, true) => fmt::Display::fmt(kind, f)?,
        }

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => fmt::Display::fmt(e, f),
            Self::Protocol(e) => fmt::Display::fmt(e, f),
            Self::Io(e) => fmt::Display::fmt(e, f),
            Self::Status(e) => fmt::Display::fmt(e, f),
            Self::Encode(e) => fmt::Display::fmt(e, f),
            Self::Decode(e) => fmt::Display::fmt(e, f),
            Self::RowNotFound(e) => fmt::Display::fmt(e, f),
            Self::Utf8(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Error reported by a handle.
///
/// `code == 0` is a client side error, `code > 0` carries the server errno.
#[derive(Clone, PartialEq, Eq)]
pub struct StatusError {
    code: u32,
    message: String,
    server: bool,
}

impl StatusError {
    pub fn client(message: impl Into<String>) -> StatusError {
        let mut message = message.into();
        if message.is_empty() {
            message.push_str("unknown client error");
        }
        Self { code: 0, message, server: false }
    }

    pub fn server(code: u32, message: impl Into<String>) -> StatusError {
        Self { code, message: message.into(), server: true }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if the error was raised by the server with an errno.
    pub fn is_server(&self) -> bool {
        self.server && self.code > 0
    }
}

impl std::error::Error for StatusError { }

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.server, self.code, self.message.is_empty()) {
            (true, code, true) => write!(f, "server error code={code}"),
            (true, code, false) if code > 0 => {
                write!(f, "server error code={code} message={}", self.message)
            }
            _ => f.write_str(&self.message),
        }
    }
}

impl fmt::Debug for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
