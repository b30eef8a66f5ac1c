//! Machbase CMI wire protocol, version 4.0.2.
//!
//! After the 9 byte handshake, every message is a sequence of [packets][packet]
//! whose bodies carry typed [marshal units][marshal].
//!
//! - [`packet`], 16 byte header framing and reassembly
//! - [`marshal`], unit encoding inside a packet body
//! - [`cmd_type`], column kinds, sql types and null sentinels
pub mod packet;
pub mod marshal;
pub mod cmd_type;
mod response;
mod error;

pub use error::ProtocolError;
pub use packet::{Packet, PacketHeader};
pub use marshal::{MarshalReader, MarshalWriter, Unit, Units};
pub use cmd_type::{CmdType, ColumnDesc, ParamDesc, SqlType, StmtType};

pub(crate) use response::{
    FetchChunk, Session, StmtResponse, count_placeholders, parse_append_close,
    parse_append_data, parse_connect, parse_fetch, parse_free, parse_stmt,
};

pub const PROTOCOL_MAJOR: u16 = 4;
pub const PROTOCOL_MINOR: u16 = 0;
pub const PROTOCOL_FIX: u32 = 2;

/// Packed protocol version sent at connect, `major<<48 | minor<<32 | fix`.
pub const fn protocol_version() -> u64 {
    (PROTOCOL_MAJOR as u64) << 48 | (PROTOCOL_MINOR as u64) << 32 | PROTOCOL_FIX as u64
}

/// Maximum packet body produced by the encoder.
pub const MAX_BODY: usize = 64 * 1024;

/// Client handshake, prefix followed by the endian marker.
pub const HANDSHAKE: &[u8; 9] = b"CMI_INET0";

/// Server handshake reply.
pub const HANDSHAKE_READY: &[u8; 9] = b"CMI_READY";

/// Protocol ids, the low byte of a packet header protocol field.
pub mod proto {
    pub const CONNECT: u8 = 0;
    pub const DISCONNECT: u8 = 1;
    pub const PREPARE: u8 = 6;
    pub const EXECUTE: u8 = 7;
    pub const EXEC_DIRECT: u8 = 8;
    pub const FETCH: u8 = 9;
    pub const FREE: u8 = 10;
    pub const APPEND_OPEN: u8 = 11;
    pub const APPEND_DATA: u8 = 12;
    pub const APPEND_CLOSE: u8 = 13;
}

/// Marshal unit ids.
pub mod unit {
    // connect
    pub const VERSION: u32 = 0x01;
    pub const CLIENT_ID: u32 = 0x02;
    pub const DATABASE_ID: u32 = 0x04;
    pub const ENDIAN: u32 = 0x05;
    pub const USER_ID: u32 = 0x06;
    pub const PASSWORD: u32 = 0x07;
    pub const TIMEOUT: u32 = 0x08;
    pub const SESSION_ID: u32 = 0x40;
    pub const SHC: u32 = 0x41;
    pub const IP: u32 = 0x42;

    // result
    pub const RESULT: u32 = 0x10;
    pub const MESSAGE: u32 = 0x11;
    pub const ERR_MESSAGE: u32 = 0x12;

    // prepare
    pub const STATEMENT: u32 = 0x20;
    pub const PARAM_BINDS: u32 = 0x21;
    pub const PID: u32 = 0x22;
    pub const ROWS: u32 = 0x23;
    pub const COLUMNS: u32 = 0x24;
    pub const TABLE: u32 = 0x25;
    pub const COL_NAME: u32 = 0x26;
    pub const COL_TYPE: u32 = 0x27;
    pub const PARAM_TYPE: u32 = 0x29;

    // execute
    pub const EXEC_PARAM: u32 = 0x31;
    pub const EXEC_ENDIAN: u32 = 0x34;

    // exec direct
    pub const DIRECT_STATEMENT: u32 = 0x40;

    // fetch
    pub const FETCH_ID: u32 = 0x50;
    pub const FETCH_ROWS: u32 = 0x51;
    pub const FETCH_VALUE: u32 = 0x52;

    // free and append
    pub const FREE_ID: u32 = 0x60;
    pub const APPEND_SUCCESS: u32 = 0x61;
    pub const APPEND_FAILURE: u32 = 0x62;

    pub const STMT_TYPE: u32 = 200;
}

const STATUS_OK: u64 = 0x724f_4b5f_0000_0000;
const STATUS_CM_ERROR: u64 = 0x7243_4d5f_0000_0000;
const STATUS_LAST: u64 = 0x724c_5354_0000_0000;

/// Result status carried by the `RESULT` unit.
///
/// The high 32 bits select the status, the low 32 bits carry the server errno.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    Last,
    Error { code: u32 },
}

impl Status {
    pub const fn from_wire(value: u64) -> Status {
        match value & 0xffff_ffff_0000_0000 {
            STATUS_OK => Status::Ok,
            STATUS_LAST => Status::Last,
            // no known producer, reported like any other server error
            STATUS_CM_ERROR => Status::Error { code: value as u32 },
            _ => Status::Error { code: value as u32 },
        }
    }

    pub const fn to_wire(self) -> u64 {
        match self {
            Status::Ok => STATUS_OK,
            Status::Last => STATUS_LAST,
            Status::Error { code } => STATUS_CM_ERROR | code as u64,
        }
    }

    pub const fn is_error(self) -> bool {
        matches!(self, Status::Error { .. })
    }
}
