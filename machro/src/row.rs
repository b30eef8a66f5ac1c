//! Result row decoding.
//!
//! - [`Row`]
//! - [`Column`]
//! - [`FromRow`]
//! - [`Decode`]
//!
//! - [`Index`]
//! - [`DecodeError`]
use bytes::Bytes;
use std::{
    borrow::Cow,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::Utf8Error,
    string::FromUtf8Error,
    sync::Arc,
    time::SystemTime,
};

use crate::{
    Value,
    common::{ByteStr, unit_error},
    ext::SliceExt,
    protocol::{CmdType, ColumnDesc, ProtocolError, SqlType, cmd_type::null},
    value::nanos_system_time,
};

// ===== Wire =====

/// Decode one row payload against the result columns.
///
/// Fixed columns are big endian and compared against their null sentinel,
/// variable columns carry a big endian `u32` length where `0` is null.
pub(crate) fn decode_row(data: &Bytes, columns: &[ColumnDesc]) -> Result<Vec<Value>, ProtocolError> {
    let mut values = Vec::with_capacity(columns.len());
    let mut off = 0;

    for col in columns {
        if col.is_variable() {
            let len = data
                .get(off..)
                .and_then(|e| e.be_u32())
                .ok_or(ProtocolError::Malformed("malformed row variable length"))?
                as usize;
            off += 4;
            if len == 0 {
                values.push(Value::Null);
                continue;
            }
            if off + len > data.len() {
                return Err(ProtocolError::Malformed("malformed row variable overrun"));
            }
            let field = data.slice(off..off + len);
            off += len;
            values.push(match col.cmd_type.is_textual() {
                true => Value::String(ByteStr::from_utf8_lossy(field)),
                false => Value::Binary(field),
            });
            continue;
        }

        let len = col.length as usize;
        if len == 0 {
            values.push(Value::Null);
            continue;
        }
        if off + len > data.len() {
            return Err(ProtocolError::Malformed("malformed row fixed overrun"));
        }
        let field = data.slice(off..off + len);
        off += len;
        values.push(decode_fixed(col.cmd_type, field));
    }

    Ok(values)
}

fn decode_fixed(ty: CmdType, field: Bytes) -> Value {
    let be16 = || field.be_u16().unwrap_or(null::UINT16);
    let be32 = || field.be_u32().unwrap_or(null::UINT32);
    let be64 = || field.be_u64().unwrap_or(null::UINT64);

    match ty {
        CmdType::BOOL | CmdType::INT16 => match be16() {
            null::INT16 => Value::Null,
            v => Value::Int16(v as i16),
        },
        CmdType::UINT16 => match be16() {
            null::UINT16 => Value::Null,
            v => Value::Int32(v.into()),
        },
        CmdType::INT32 => match be32() {
            null::INT32 => Value::Null,
            v => Value::Int32(v as i32),
        },
        CmdType::UINT32 => match be32() {
            null::UINT32 => Value::Null,
            v => Value::Int64(v.into()),
        },
        CmdType::INT64 => match be64() {
            null::INT64 => Value::Null,
            v => Value::Int64(v as i64),
        },
        CmdType::UINT64 => match be64() {
            null::UINT64 => Value::Null,
            v => Value::Int64(v as i64),
        },
        CmdType::FLT32 => match f32::from_bits(be32()) {
            v if v == null::FLOAT => Value::Null,
            v => Value::Float32(v),
        },
        CmdType::FLT64 => match f64::from_bits(be64()) {
            v if v == null::DOUBLE => Value::Null,
            v => Value::Float64(v),
        },
        CmdType::DATE => match be64() {
            null::DATETIME => Value::Null,
            v => Value::DateTime(v as i64),
        },
        CmdType::IPV4 => match <[u8; 4]>::try_from(field.get(1..5).unwrap_or_default()) {
            Ok(octets) if field[0] != 0 => Value::Ipv4(octets.into()),
            _ => Value::Null,
        },
        CmdType::IPV6 => match <[u8; 16]>::try_from(field.get(1..17).unwrap_or_default()) {
            Ok(octets) if field[0] != 0 => Value::Ipv6(octets.into()),
            _ => Value::Null,
        },
        CmdType::NUL => Value::Null,
        _ if field.iter().all(|&b| b == 0) => Value::Null,
        _ => Value::Binary(field),
    }
}

// ===== Row =====

/// A decoded result row.
#[derive(Clone, PartialEq)]
pub struct Row {
    columns: Arc<[ColumnDesc]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[ColumnDesc]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Try get and decode column.
    pub fn try_get<I: Index, R: Decode>(&self, idx: I) -> Result<R, DecodeError> {
        let nth = idx.position(&self.columns)?;
        let value = self.values.get(nth).cloned().unwrap_or_default();
        R::decode(Column::new(&self.columns[nth], value))
    }

    /// Try decode type using [`FromRow`] implementation.
    pub fn decode<D: FromRow>(self) -> Result<D, DecodeError> {
        D::from_row(self)
    }
}

impl IntoIterator for Row {
    type Item = Column;

    type IntoIter = IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter {
            columns: self.columns,
            values: self.values.into_iter(),
            iter_n: 0,
        }
    }
}

/// [`IntoIterator`] implementation from [`Row`].
#[derive(Debug)]
pub struct IntoIter {
    columns: Arc<[ColumnDesc]>,
    values: std::vec::IntoIter<Value>,
    iter_n: usize,
}

impl Iterator for IntoIter {
    type Item = Column;

    fn next(&mut self) -> Option<Self::Item> {
        let value = self.values.next()?;
        let desc = self.columns.get(self.iter_n)?;
        self.iter_n += 1;
        Some(Column::new(desc, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.values.size_hint()
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (col, value) in self.columns.iter().zip(&self.values) {
            dbg.entry(&col.name, &format_args!("{value}"));
        }
        dbg.finish()
    }
}

/// A single column value with its metadata.
#[derive(Debug, Clone)]
pub struct Column {
    name: ByteStr,
    cmd_type: CmdType,
    value: Value,
}

impl Column {
    fn new(desc: &ColumnDesc, value: Value) -> Self {
        Self { name: desc.name.clone(), cmd_type: desc.cmd_type, value }
    }

    /// Returns column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn cmd_type(&self) -> CmdType {
        self.cmd_type
    }

    pub const fn sql_type(&self) -> SqlType {
        self.cmd_type.sql_type()
    }

    /// Return `true` if value is NULL.
    pub const fn is_null(&self) -> bool {
        self.value.is_null()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Try decode type using [`Decode`] implementation.
    pub fn decode<D: Decode>(self) -> Result<D, DecodeError> {
        D::decode(self)
    }

    pub(crate) fn mismatch(&self, expect: &'static str) -> DecodeError {
        DecodeError::TypeMismatch { expect, found: self.value.type_name() }
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow: Sized {
    /// Construct self from row.
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for Vec<Value> {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row.values)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: Decode),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5, T6 6);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5, T6 6, T7 7);

/// A type that can be constructed from [`Column`].
pub trait Decode: Sized {
    /// Try decode self from column.
    fn decode(column: Column) -> Result<Self, DecodeError>;
}

impl Decode for Column {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        Ok(column)
    }
}

impl Decode for Value {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        Ok(column.value)
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.is_null() {
            true => Ok(None),
            false => column.decode().map(Some),
        }
    }
}

macro_rules! decode_int {
    ($($ty:ty),*) => {$(
        impl Decode for $ty {
            fn decode(col: Column) -> Result<Self, DecodeError> {
                let v = match col.value {
                    Value::Int16(v) => i64::from(v),
                    Value::Int32(v) => i64::from(v),
                    Value::Int64(v) => v,
                    Value::Null => return Err(DecodeError::Null),
                    _ => return Err(col.mismatch(stringify!($ty))),
                };
                <$ty>::try_from(v).map_err(|_| DecodeError::OutOfRange(stringify!($ty)))
            }
        }
    )*};
}

decode_int!(i16, i32, i64, u16, u32, u64);

impl Decode for f32 {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match col.value {
            Value::Float32(v) => Ok(v),
            Value::Null => Err(DecodeError::Null),
            _ => Err(col.mismatch("f32")),
        }
    }
}

impl Decode for f64 {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match col.value {
            Value::Float32(v) => Ok(v.into()),
            Value::Float64(v) => Ok(v),
            Value::Null => Err(DecodeError::Null),
            _ => Err(col.mismatch("f64")),
        }
    }
}

impl Decode for bool {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match col.value {
            Value::Bool(v) => Ok(v),
            Value::Int16(v) => Ok(v != 0),
            Value::Null => Err(DecodeError::Null),
            _ => Err(col.mismatch("bool")),
        }
    }
}

impl Decode for ByteStr {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match col.value {
            Value::String(v) => Ok(v),
            Value::Binary(v) => Ok(ByteStr::from_utf8(v)?),
            Value::Null => Err(DecodeError::Null),
            _ => Err(col.mismatch("string")),
        }
    }
}

impl Decode for String {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        ByteStr::decode(col).map(Into::into)
    }
}

impl Decode for Bytes {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match col.value {
            Value::Binary(v) => Ok(v),
            Value::String(v) => Ok(v.into_bytes()),
            Value::Null => Err(DecodeError::Null),
            _ => Err(col.mismatch("bytes")),
        }
    }
}

impl Decode for Vec<u8> {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        Bytes::decode(col).map(Into::into)
    }
}

impl Decode for IpAddr {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match col.value {
            Value::Ipv4(v) => Ok(v.into()),
            Value::Ipv6(v) => Ok(v.into()),
            Value::Null => Err(DecodeError::Null),
            _ => Err(col.mismatch("ip")),
        }
    }
}

impl Decode for Ipv4Addr {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match col.value {
            Value::Ipv4(v) => Ok(v),
            Value::Null => Err(DecodeError::Null),
            _ => Err(col.mismatch("ipv4")),
        }
    }
}

impl Decode for Ipv6Addr {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match col.value {
            Value::Ipv6(v) => Ok(v),
            Value::Ipv4(v) => Ok(v.to_ipv6_mapped()),
            Value::Null => Err(DecodeError::Null),
            _ => Err(col.mismatch("ipv6")),
        }
    }
}

impl Decode for SystemTime {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match col.value {
            Value::DateTime(v) => Ok(nanos_system_time(v)),
            Value::Null => Err(DecodeError::Null),
            _ => Err(col.mismatch("datetime")),
        }
    }
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the column position.
    fn position(self, columns: &[ColumnDesc]) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(self, columns: &[ColumnDesc]) -> Result<usize, DecodeError> {
        match self < columns.len() {
            true => Ok(self),
            false => Err(DecodeError::IndexOutOfBounds(self)),
        }
    }
}

/// Column names are matched case insensitively, the server reports them in
/// upper case.
impl Index for &str {
    fn position(self, columns: &[ColumnDesc]) -> Result<usize, DecodeError> {
        columns
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(self))
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

unit_error! {
    /// An error when a single row query returns no row.
    pub struct RowNotFound("no rows in result set");
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for DecodeError {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

/// An error when decoding row value.
pub enum DecodeError {
    /// Binary value is not a valid utf8 string.
    Utf8(Utf8Error),
    /// Column requested not found.
    ColumnNotFound(Cow<'static,str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Value kind cannot be decoded into the requested type.
    TypeMismatch {
        expect: &'static str,
        found: &'static str,
    },
    /// Integer value does not fit the requested type.
    OutOfRange(&'static str),
    /// Value is null.
    Null,
    /// Failed to deserialize using `serde_json`.
    #[cfg(feature = "json")]
    Json(serde_json::error::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::Utf8(e) => write!(f, "{e}"),
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::TypeMismatch { expect, found } => {
                write!(f, "cannot decode {found} as {expect}")
            }
            Self::OutOfRange(ty) => write!(f, "value out of {ty} range"),
            Self::Null => write!(f, "unexpected NULL value"),
            #[cfg(feature = "json")]
            Self::Json(e) => write!(f, "{e}"),
        }
    }
}

from!(<Utf8Error>e => Self::Utf8(e));
from!(<FromUtf8Error>e => Self::Utf8(e.utf8_error()));
#[cfg(feature = "json")]
from!(<serde_json::error::Error>e => Self::Json(e));

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
