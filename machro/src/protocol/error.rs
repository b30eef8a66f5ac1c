//! Protocol error
use std::fmt;

use crate::ext::FmtExt;

/// An error when the bytes from the server violate the wire protocol.
pub enum ProtocolError {
    /// Response protocol id differ from the request.
    Unexpected {
        expect: u8,
        found: u8,
    },
    /// Server did not answer the handshake with `CMI_READY`.
    Handshake([u8; 9]),
    /// Invalid continuation flag transition while reassembling.
    Continuation {
        prev: Option<u8>,
        found: u8,
    },
    /// Protocol id changed in the middle of a multi packet message.
    ProtocolChanged {
        expect: u8,
        found: u8,
    },
    /// Marshal unit header cut short.
    IncompleteHeader,
    /// Marshal unit payload run past the body.
    Overflow {
        ty: u32,
        off: usize,
        need: usize,
        len: usize,
    },
    /// Connect response without a usable `RESULT` unit.
    MissingResult,
    /// Malformed row payload.
    Malformed(&'static str),
}

impl ProtocolError {
    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect, found }
    }

    /// Returns `true` if the byte stream can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::Continuation { .. } | Self::ProtocolChanged { .. }
        )
    }
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unexpected { expect, found } => {
                write!(f, "unexpected protocol {found} expected {expect}")
            }
            Self::Handshake(reply) => write!(f, "handshake failed: {:?}", reply.lossy()),
            Self::Continuation { prev: Some(prev), found } => {
                write!(f, "invalid packet flag {found} after flag {prev}")
            }
            Self::Continuation { prev: None, found } => {
                write!(f, "invalid packet flag {found} at message start")
            }
            Self::ProtocolChanged { expect, found } => {
                write!(f, "protocol changed mid message, expected {expect} found {found}")
            }
            Self::IncompleteHeader => f.write_str("incomplete marshal header"),
            Self::Overflow { ty, off, need, len } => {
                write!(f, "marshal overflow type={ty} off={off} need={need} buf={len}")
            }
            Self::MissingResult => f.write_str("connect response missing result"),
            Self::Malformed(msg) => f.write_str(msg),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
