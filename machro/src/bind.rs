//! Bound parameter encoding.
//!
//! The execute parameter payload is `[count:u16]` followed, per parameter, by
//! an 11 byte descriptor and the value bytes, padded so each entry end on an
//! even offset. Every integer is big endian.
use bytes::{BufMut, Bytes, BytesMut};
use std::{borrow::Cow, fmt, net::IpAddr};

use crate::{
    Value,
    ext::UsizeExt,
    protocol::{SqlType, cmd_type::null},
};

/// Parameter direction, input only.
const PARAM_INPUT: u8 = 1;

/// A parameter bound to a statement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoundParam {
    pub sql_type: SqlType,
    pub value: Value,
}

impl BoundParam {
    pub fn new(sql_type: SqlType, value: impl Into<Value>) -> BoundParam {
        Self { sql_type, value: value.into() }
    }

    /// Unbound slot, a null string.
    pub fn null() -> BoundParam {
        Self { sql_type: SqlType::String, value: Value::Null }
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }
}

/// Encode parameters into the execute payload.
///
/// Returns empty bytes for no parameters.
pub fn encode_params(params: &[BoundParam]) -> Result<Bytes, EncodeError> {
    if params.is_empty() {
        return Ok(Bytes::new());
    }

    let mut buf = BytesMut::with_capacity(128);
    buf.put_u16(params.len().to_u16());

    for (idx, param) in params.iter().enumerate() {
        let data = encode_param(param).map_err(|e| e.within(format_args!("bind {idx}")))?;
        let len = data.len().to_u32();

        buf.put_u8((idx + 1) as u8);
        buf.put_u8(PARAM_INPUT);
        buf.put_u8(param.sql_type.cmd_type().0);
        buf.put_u32(len);
        buf.put_u32(len);
        buf.put_slice(&data);

        if buf.len() & 1 == 1 {
            buf.put_u8(0);
        }
    }

    Ok(buf.freeze())
}

fn encode_param(param: &BoundParam) -> Result<Bytes, EncodeError> {
    if param.is_null() {
        return Ok(null_sentinel(param.sql_type));
    }

    let value = &param.value;
    let mut buf = BytesMut::with_capacity(8);
    match param.sql_type {
        SqlType::Int16 => buf.put_i16(narrow(value.to_i64()?, "int16")?),
        SqlType::Int32 => buf.put_i32(narrow(value.to_i64()?, "int32")?),
        SqlType::Int64 => buf.put_i64(value.to_i64()?),
        SqlType::DateTime => buf.put_i64(value.to_datetime()?),
        SqlType::Float => buf.put_f32(value.to_f64()? as f32),
        SqlType::Double => buf.put_f64(value.to_f64()?),
        SqlType::Ipv4 => {
            match value.to_ip()? {
                IpAddr::V4(ip) => put_ip(&mut buf, 4, &ip.octets()),
                IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                    Some(ip) => put_ip(&mut buf, 4, &ip.octets()),
                    None => buf.put_bytes(0, 5),
                },
            }
        }
        SqlType::Ipv6 => {
            let ip = match value.to_ip()? {
                IpAddr::V4(ip) => ip.to_ipv6_mapped(),
                IpAddr::V6(ip) => ip,
            };
            put_ip(&mut buf, 6, &ip.octets());
        }
        SqlType::Binary => return value.to_binary(),
        SqlType::String => return Ok(value.to_text()),
    }
    Ok(buf.freeze())
}

fn put_ip(buf: &mut BytesMut, family: u8, octets: &[u8]) {
    buf.put_u8(family);
    buf.put_slice(octets);
}

/// Type specific null encoding.
pub(crate) fn null_sentinel(sql_type: SqlType) -> Bytes {
    let mut buf = BytesMut::with_capacity(17);
    match sql_type {
        SqlType::Int16 => buf.put_u16(null::INT16),
        SqlType::Int32 => buf.put_u32(null::INT32),
        SqlType::Int64 => buf.put_u64(null::INT64),
        SqlType::DateTime => buf.put_u64(null::DATETIME),
        SqlType::Float => buf.put_f32(null::FLOAT),
        SqlType::Double => buf.put_f64(null::DOUBLE),
        SqlType::Ipv4 => buf.put_bytes(0, 5),
        SqlType::Ipv6 => buf.put_bytes(0, 17),
        SqlType::String | SqlType::Binary => {}
    }
    buf.freeze()
}

/// Range checked integer narrowing.
pub(crate) fn narrow<T: TryFrom<i64>>(value: i64, name: &str) -> Result<T, EncodeError> {
    T::try_from(value).map_err(|_| EncodeError::new(format!("out of {name} range: {value}")))
}

/// An error when a value cannot be encoded as the requested type.
pub struct EncodeError {
    reason: Cow<'static, str>,
}

impl EncodeError {
    pub(crate) fn new(reason: impl Into<Cow<'static, str>>) -> EncodeError {
        Self { reason: reason.into() }
    }

    /// Prefix the reason, `"{prefix}: {reason}"`.
    pub(crate) fn within(self, prefix: impl fmt::Display) -> EncodeError {
        Self { reason: format!("{prefix}: {}", self.reason).into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl std::error::Error for EncodeError { }

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl fmt::Debug for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
