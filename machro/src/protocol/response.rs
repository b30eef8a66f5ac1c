//! Response parsing.
use bytes::Bytes;

use super::{ColumnDesc, ParamDesc, ProtocolError, Status, StmtType, Units, unit};
use crate::{
    Result,
    common::ByteStr,
    error::StatusError,
    ext::{Endian, SliceExt},
    row::decode_row,
    value::Value,
};

/// Parsed prepare, execute, exec direct and append open response.
#[derive(Debug, Default)]
pub struct StmtResponse {
    pub stmt_type: StmtType,
    pub message: String,
    pub row_count: i64,
    pub columns: Vec<ColumnDesc>,
    pub params: Vec<ParamDesc>,
    pub rows: Vec<Vec<Value>>,
    pub last: bool,
}

/// Session established by the connect response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub session_id: u64,
    pub endian: Endian,
}

fn status_of(unit: &super::Unit) -> Option<Status> {
    unit.as_u64().map(Status::from_wire)
}

pub fn parse_connect(body: Bytes) -> Result<Session> {
    let units = Units::collect(body)?;

    let Some(status) = units.first(unit::RESULT).and_then(status_of) else {
        return Err(ProtocolError::MissingResult.into());
    };

    if status != Status::Ok {
        let code = match status {
            Status::Error { code } => code,
            _ => 0,
        };
        return Err(StatusError::server(code, units.string(unit::MESSAGE)).into());
    }

    let session_id = units.first(unit::SESSION_ID).and_then(|e| e.as_u64()).unwrap_or_default();

    let endian = match units.first(unit::ENDIAN) {
        Some(e) if e.data.len() >= 4 => e.data.le_u32().unwrap_or_default(),
        Some(e) => e.data.first().copied().map(u32::from).unwrap_or_default(),
        None => 0,
    };

    Ok(Session { session_id, endian: Endian::from_wire(endian) })
}

/// Parse a statement response.
///
/// `fallback` columns are used when the response carries no column metadata,
/// which is the case for the execute response of a prepared statement.
pub fn parse_stmt(body: Bytes, sql: &str, fallback: &[ColumnDesc]) -> Result<StmtResponse> {
    let units = Units::collect(body)?;
    let mut res = StmtResponse {
        stmt_type: StmtType::infer(sql),
        message: units.string(unit::MESSAGE),
        ..Default::default()
    };

    if let Some(rows) = units.first(unit::ROWS).and_then(|e| e.as_uint()) {
        res.row_count = rows as i64;
    }
    // zero means the server did not classify the statement
    if let Some(ty) = units.first(unit::STMT_TYPE).and_then(|e| e.as_i32()).filter(|e| *e != 0) {
        res.stmt_type = StmtType(ty);
    }

    let param_types = units.all(unit::PARAM_TYPE);
    res.params = match param_types.is_empty() {
        false => param_types
            .iter()
            .map(|e| e.as_u64().map(ParamDesc::new).unwrap_or_default())
            .collect(),
        true => vec![ParamDesc::default(); count_placeholders(sql)],
    };

    res.columns = columns(&units);
    if res.columns.is_empty() {
        res.columns = fallback.to_vec();
    }
    res.rows = rows(&units, &res.columns)?;

    for status in units.all(unit::RESULT).iter().filter_map(status_of) {
        match status {
            Status::Ok => {}
            Status::Last => res.last = true,
            Status::Error { code } => {
                let err_message = units.string(unit::ERR_MESSAGE);
                let message = join_message(res.message, &err_message);
                return Err(StatusError::server(code, message).into());
            }
        }
    }

    Ok(res)
}

/// One fetch chunk.
#[derive(Debug, Default)]
pub struct FetchChunk {
    pub rows: Vec<Vec<Value>>,
    pub last: bool,
    /// The server reported zero rows without any value.
    pub exhausted: bool,
}

pub fn parse_fetch(body: Bytes, columns: &[ColumnDesc]) -> Result<FetchChunk> {
    let units = Units::collect(body)?;
    let mut chunk = FetchChunk::default();

    for status in units.all(unit::RESULT).iter().filter_map(status_of) {
        match status {
            Status::Ok => {}
            Status::Last => chunk.last = true,
            Status::Error { code } => {
                return Err(StatusError::server(code, units.string(unit::MESSAGE)).into());
            }
        }
    }

    chunk.rows = rows(&units, columns)?;

    let values = units.all(unit::FETCH_VALUE);
    chunk.exhausted = values.is_empty()
        && units.first(unit::FETCH_ROWS).and_then(|e| e.as_uint()) == Some(0);

    Ok(chunk)
}

pub fn parse_free(body: Bytes) -> Result<()> {
    let units = Units::collect(body)?;
    if let Some(Status::Error { code }) = units.first(unit::RESULT).and_then(status_of) {
        return Err(StatusError::server(code, units.string(unit::MESSAGE)).into());
    }
    Ok(())
}

pub fn parse_append_data(body: Bytes) -> Result<()> {
    let units = Units::collect(body)?;

    for status in units.all(unit::RESULT).iter().filter_map(status_of) {
        if let Status::Error { code } = status {
            let message = units.string(unit::MESSAGE);
            let message = join_message(message, &units.string(unit::ERR_MESSAGE));
            return Err(StatusError::server(code, message).into());
        }
    }

    let failed = units.first(unit::APPEND_FAILURE).and_then(|e| e.as_u64()).unwrap_or_default();
    if failed > 0 {
        let mut message = units.string(unit::MESSAGE);
        if message.is_empty() {
            message = format!("append data failed rows={failed}");
        }
        return Err(StatusError::client(message).into());
    }

    Ok(())
}

/// Returns the server `(success, fail)` counters.
pub fn parse_append_close(body: Bytes) -> Result<(i64, i64)> {
    let units = Units::collect(body)?;
    if let Some(Status::Error { code }) = units.first(unit::RESULT).and_then(status_of) {
        return Err(StatusError::server(code, units.string(unit::MESSAGE)).into());
    }

    let count = |id| units.first(id).and_then(|e| e.as_u64()).unwrap_or_default() as i64;
    Ok((count(unit::APPEND_SUCCESS), count(unit::APPEND_FAILURE)))
}

/// Count `?` outside of quoted literals and identifiers.
pub fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut single = false;
    let mut double = false;
    let mut iter = sql.bytes().peekable();

    while let Some(b) = iter.next() {
        if single {
            if b == b'\'' {
                // '' is an escaped quote
                if iter.peek() == Some(&b'\'') {
                    iter.next();
                } else {
                    single = false;
                }
            }
            continue;
        }
        if double {
            if b == b'"' {
                double = false;
            }
            continue;
        }
        match b {
            b'\'' => single = true,
            b'"' => double = true,
            b'?' => count += 1,
            _ => {}
        }
    }

    count
}

fn join_message(message: String, err_message: &str) -> String {
    match (message.is_empty(), err_message.is_empty()) {
        (_, true) => message,
        (true, false) => err_message.to_owned(),
        (false, false) => format!("{message}; {err_message}"),
    }
}

fn columns(units: &Units) -> Vec<ColumnDesc> {
    let names = units.all(unit::COL_NAME);
    let types = units.all(unit::COL_TYPE);
    names
        .iter()
        .zip(types)
        .map(|(name, ty)| {
            let name = ByteStr::from_utf8_lossy(name.data.clone());
            ColumnDesc::new(name, ty.as_u64().unwrap_or_default())
        })
        .collect()
}

fn rows(units: &Units, columns: &[ColumnDesc]) -> Result<Vec<Vec<Value>>> {
    let values = units.all(unit::FETCH_VALUE);
    if columns.is_empty() {
        return Ok(vec![]);
    }
    let rows = values
        .iter()
        .map(|e| decode_row(&e.data, columns))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
