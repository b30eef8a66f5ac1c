//! Dynamically typed value.
//!
//! [`Value`] is what caller pass as parameters and append arguments, and what
//! row decoding produce.
use bytes::Bytes;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{bind::EncodeError, common::ByteStr, ext::FmtExt, protocol::SqlType};

/// A single column value.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    /// Nanoseconds since unix epoch.
    DateTime(i64),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    String(ByteStr),
    Binary(Bytes),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::DateTime(_) => "datetime",
            Value::Ipv4(_) => "ipv4",
            Value::Ipv6(_) => "ipv6",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
        }
    }

    /// Sql type a parameter of this value is bound as.
    ///
    /// Returns [`None`] for [`Value::Null`], which takes the described
    /// parameter type instead.
    pub const fn sql_type(&self) -> Option<SqlType> {
        let ty = match self {
            Value::Null => return None,
            Value::Bool(_) | Value::Int16(_) => SqlType::Int16,
            Value::Int32(_) => SqlType::Int32,
            Value::Int64(_) => SqlType::Int64,
            Value::Float32(_) => SqlType::Float,
            Value::Float64(_) => SqlType::Double,
            Value::DateTime(_) => SqlType::DateTime,
            Value::Ipv4(_) => SqlType::Ipv4,
            Value::Ipv6(_) => SqlType::Ipv6,
            Value::String(_) => SqlType::String,
            Value::Binary(_) => SqlType::Binary,
        };
        Some(ty)
    }

    /// Returns the str if value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    // ===== Coercion =====

    /// Integer from any numeric value or a decimal string, floats are truncated.
    pub fn to_i64(&self) -> Result<i64, EncodeError> {
        match *self {
            Value::Bool(v) => Ok(v as i64),
            Value::Int16(v) => Ok(v.into()),
            Value::Int32(v) => Ok(v.into()),
            Value::Int64(v) => Ok(v),
            Value::Float32(v) => Ok(v as i64),
            Value::Float64(v) => Ok(v as i64),
            Value::String(ref s) => s.trim().parse().map_err(|e| {
                EncodeError::new(format!("invalid integer {:?}: {e}", s.as_str()))
            }),
            _ => Err(self.unsupported("integer")),
        }
    }

    pub fn to_f64(&self) -> Result<f64, EncodeError> {
        match *self {
            Value::Int16(v) => Ok(v.into()),
            Value::Int32(v) => Ok(v.into()),
            Value::Int64(v) => Ok(v as f64),
            Value::Float32(v) => Ok(v.into()),
            Value::Float64(v) => Ok(v),
            Value::String(ref s) => s.trim().parse().map_err(|e| {
                EncodeError::new(format!("invalid float {:?}: {e}", s.as_str()))
            }),
            _ => Err(self.unsupported("float")),
        }
    }

    /// Unix nanoseconds from a datetime, an integer, or a decimal or RFC 3339 string.
    pub fn to_datetime(&self) -> Result<i64, EncodeError> {
        match *self {
            Value::DateTime(v) => Ok(v),
            Value::Int16(v) => Ok(v.into()),
            Value::Int32(v) => Ok(v.into()),
            Value::Int64(v) => Ok(v),
            Value::String(ref s) => {
                if let Ok(nanos) = s.trim().parse() {
                    return Ok(nanos);
                }
                parse_datetime(s)
            }
            _ => Err(self.unsupported("datetime")),
        }
    }

    /// Address from an address, its text form, or 4 or 16 raw bytes.
    pub fn to_ip(&self) -> Result<IpAddr, EncodeError> {
        match self {
            Value::Ipv4(ip) => Ok(IpAddr::V4(*ip)),
            Value::Ipv6(ip) => Ok(IpAddr::V6(*ip)),
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| EncodeError::new(format!("invalid ip {:?}", s.as_str()))),
            Value::Binary(b) => {
                if let Ok(octets) = <[u8; 4]>::try_from(&b[..]) {
                    return Ok(IpAddr::from(octets));
                }
                if let Ok(octets) = <[u8; 16]>::try_from(&b[..]) {
                    return Ok(IpAddr::from(octets));
                }
                std::str::from_utf8(b)
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or_else(|| EncodeError::new("invalid ip bytes"))
            }
            _ => Err(self.unsupported("ip")),
        }
    }

    /// Boolean from a bool, any numeric or the usual yes/no strings.
    pub fn to_bool(&self) -> Result<bool, EncodeError> {
        match *self {
            Value::Bool(v) => Ok(v),
            Value::Int16(v) => Ok(v != 0),
            Value::Int32(v) => Ok(v != 0),
            Value::Int64(v) => Ok(v != 0),
            Value::Float32(v) => Ok(v != 0.0),
            Value::Float64(v) => Ok(v != 0.0),
            Value::String(ref s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "t" | "y" | "yes" => Ok(true),
                "0" | "false" | "f" | "n" | "no" => Ok(false),
                _ => Err(EncodeError::new(format!("invalid boolean string {:?}", s.as_str()))),
            },
            _ => Err(self.unsupported("boolean")),
        }
    }

    /// Raw bytes of a string or binary value.
    pub fn to_binary(&self) -> Result<Bytes, EncodeError> {
        match self {
            Value::Binary(b) => Ok(b.clone()),
            Value::String(s) => Ok(s.clone().into_bytes()),
            _ => Err(self.unsupported("binary")),
        }
    }

    /// Text bytes, non string values are formatted.
    pub fn to_text(&self) -> Bytes {
        match self {
            Value::String(s) => s.clone().into_bytes(),
            Value::Binary(b) => b.clone(),
            other => Bytes::from(other.to_string()),
        }
    }

    fn unsupported(&self, target: &str) -> EncodeError {
        EncodeError::new(format!("unsupported {target} type {}", self.type_name()))
    }
}

#[cfg(feature = "time")]
fn parse_datetime(s: &str) -> Result<i64, EncodeError> {
    crate::types::parse_rfc3339(s.trim())
        .ok_or_else(|| EncodeError::new(format!("invalid datetime {s:?}")))
}

#[cfg(not(feature = "time"))]
fn parse_datetime(s: &str) -> Result<i64, EncodeError> {
    Err(EncodeError::new(format!("invalid datetime {s:?}")))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => fmt::Display::fmt(v, f),
            Value::Int16(v) => fmt::Display::fmt(v, f),
            Value::Int32(v) => fmt::Display::fmt(v, f),
            Value::Int64(v) | Value::DateTime(v) => fmt::Display::fmt(v, f),
            Value::Float32(v) => fmt::Display::fmt(v, f),
            Value::Float64(v) => fmt::Display::fmt(v, f),
            Value::Ipv4(v) => fmt::Display::fmt(v, f),
            Value::Ipv6(v) => fmt::Display::fmt(v, f),
            Value::String(v) => f.write_str(v),
            Value::Binary(v) => fmt::Display::fmt(&v.lossy(), f),
        }
    }
}

// ===== Conversions =====

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Value {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

from!(<bool>v => Value::Bool(v));
from!(<i8>v => Value::Int16(v.into()));
from!(<u8>v => Value::Int16(v.into()));
from!(<i16>v => Value::Int16(v));
from!(<u16>v => Value::Int32(v.into()));
from!(<i32>v => Value::Int32(v));
from!(<u32>v => Value::Int64(v.into()));
from!(<i64>v => Value::Int64(v));
from!(<f32>v => Value::Float32(v));
from!(<f64>v => Value::Float64(v));
from!(<Ipv4Addr>v => Value::Ipv4(v));
from!(<Ipv6Addr>v => Value::Ipv6(v));
from!(<IpAddr>v => match v {
    IpAddr::V4(v) => Value::Ipv4(v),
    IpAddr::V6(v) => Value::Ipv6(v),
});
from!(<SystemTime>v => Value::DateTime(system_time_nanos(v)));
from!(<&'static str>v => Value::String(ByteStr::from_static(v)));
from!(<String>v => Value::String(v.into()));
from!(<ByteStr>v => Value::String(v));
from!(<Bytes>v => Value::Binary(v));
from!(<Vec<u8>>v => Value::Binary(v.into()));
from!(<&'static [u8]>v => Value::Binary(Bytes::from_static(v)));

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Unix nanoseconds of a [`SystemTime`], negative before the epoch.
pub(crate) fn system_time_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

pub(crate) fn nanos_system_time(nanos: i64) -> SystemTime {
    match u64::try_from(nanos) {
        Ok(n) => UNIX_EPOCH + Duration::from_nanos(n),
        Err(_) => UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn integer_coercion() {
        assert_eq!(Value::from(7i16).to_i64().unwrap(), 7);
        assert_eq!(Value::from(" 42 ").to_i64().unwrap(), 42);
        assert_eq!(Value::from(3.9f64).to_i64().unwrap(), 3);
        assert_eq!(Value::from(true).to_i64().unwrap(), 1);
        let err = Value::Binary(Bytes::new()).to_i64().unwrap_err();
        assert_eq!(err.to_string(), "unsupported integer type binary");
        assert!(Value::from("x1").to_i64().is_err());
    }

    #[test]
    fn float_coercion() {
        assert_eq!(Value::from(2i32).to_f64().unwrap(), 2.0);
        assert_eq!(Value::from("1.5").to_f64().unwrap(), 1.5);
        assert!(Value::from(true).to_f64().is_err());
    }

    #[test]
    fn datetime_coercion() {
        assert_eq!(Value::DateTime(5).to_datetime().unwrap(), 5);
        assert_eq!(Value::from("1000").to_datetime().unwrap(), 1000);
        let t = UNIX_EPOCH + Duration::from_secs(2);
        assert_eq!(Value::from(t).to_datetime().unwrap(), 2_000_000_000);
        assert_eq!(nanos_system_time(-1_000), UNIX_EPOCH - Duration::from_micros(1));
        assert!(Value::from(1.0f32).to_datetime().is_err());
    }

    #[cfg(feature = "time")]
    #[test]
    fn datetime_rfc3339() {
        let v = Value::from("2025-01-02T03:04:05Z").to_datetime().unwrap();
        assert_eq!(v, 1_735_787_045_000_000_000);
        let v = Value::from("1970-01-01T00:00:00.5Z").to_datetime().unwrap();
        assert_eq!(v, 500_000_000);
    }

    #[test]
    fn ip_coercion() {
        let v4 = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(Value::from(" 10.0.0.1").to_ip().unwrap(), IpAddr::V4(v4));
        assert_eq!(Value::from(vec![10u8, 0, 0, 1]).to_ip().unwrap(), IpAddr::V4(v4));
        assert_eq!(Value::from(&b"::1"[..]).to_ip().unwrap(), IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(Value::from("nope").to_ip().unwrap_err().to_string(), "invalid ip \"nope\"");
        assert_eq!(Value::from(vec![1u8, 2]).to_ip().unwrap_err().to_string(), "invalid ip bytes");
    }

    #[test]
    fn bool_coercion() {
        assert!(Value::from("Yes").to_bool().unwrap());
        assert!(!Value::from(" f ").to_bool().unwrap());
        assert!(Value::from(2i64).to_bool().unwrap());
        let err = Value::from("maybe").to_bool().unwrap_err();
        assert_eq!(err.to_string(), "invalid boolean string \"maybe\"");
    }

    #[test]
    fn conversions() {
        assert_eq!(Value::from(Some(1u16)), Value::Int32(1));
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(u32::MAX), Value::Int64(u32::MAX as i64));
        assert_eq!(Value::from(true).sql_type(), Some(SqlType::Int16));
        assert_eq!(Value::Null.sql_type(), None);
        assert_eq!(Value::from(12.5f64).to_text(), "12.5");
        assert_eq!(Value::from("alice").as_str(), Some("alice"));
    }
}
