use time::{OffsetDateTime, PrimitiveDateTime, UtcDateTime, format_description::well_known::Rfc3339};

use crate::{
    Value,
    row::{Column, Decode, DecodeError},
};

/// Unix nanoseconds of an RFC 3339 timestamp.
pub(crate) fn parse_rfc3339(s: &str) -> Option<i64> {
    let datetime = OffsetDateTime::parse(s, &Rfc3339).ok()?;
    i64::try_from(datetime.unix_timestamp_nanos()).ok()
}

fn nanos(value: i128) -> Value {
    // saturate outside 1677..2262
    Value::DateTime(i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX }))
}

impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        nanos(value.unix_timestamp_nanos())
    }
}

impl From<UtcDateTime> for Value {
    fn from(value: UtcDateTime) -> Self {
        nanos(value.unix_timestamp_nanos())
    }
}

/// Assumed UTC.
impl From<PrimitiveDateTime> for Value {
    fn from(value: PrimitiveDateTime) -> Self {
        nanos(value.assume_utc().unix_timestamp_nanos())
    }
}

fn column_nanos(col: &Column) -> Result<i128, DecodeError> {
    match *col.value() {
        Value::DateTime(v) | Value::Int64(v) => Ok(v.into()),
        Value::Null => Err(DecodeError::Null),
        Value::String(ref s) => parse_rfc3339(s).map(Into::into).ok_or(DecodeError::OutOfRange("datetime")),
        _ => Err(col.mismatch("datetime")),
    }
}

impl Decode for OffsetDateTime {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        let nanos = column_nanos(&column)?;
        OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|_| DecodeError::OutOfRange("datetime"))
    }
}

impl Decode for UtcDateTime {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        let nanos = column_nanos(&column)?;
        UtcDateTime::from_unix_timestamp_nanos(nanos).map_err(|_| DecodeError::OutOfRange("datetime"))
    }
}
