//! Append row encoding.
//!
//! A row is
//!
//! ```text
//! [compressed=0:u8] [null_len:u32] [null bits] [fields..]
//! ```
//!
//! where every length and fixed field follow the server [`Endian`]. A null
//! column writes no field, only its bit, most significant bit first.
use bytes::{BufMut, Bytes, BytesMut};
use std::{collections::HashMap, net::IpAddr};

use crate::{
    Value,
    bind::{EncodeError, narrow},
    common::span,
    ext::{BufMutExt, Endian, UsizeExt},
    protocol::{CmdType, ColumnDesc},
};

const ARRIVAL_TIME: &str = "_ARRIVAL_TIME";

/// Where a server column take its value from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    /// Index into the row arguments.
    Arg(usize),
    Null,
    Arrival,
}

/// Server columns resolved against the caller column names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppendBindings {
    columns: Vec<Binding>,
    arrival_arg: Option<usize>,
}

/// Trim, strip double quotes and uppercase.
pub fn normalize_identifier(name: &str) -> String {
    name.trim().replace('"', "").to_ascii_uppercase()
}

fn is_arrival_alias(key: &str) -> bool {
    key == ARRIVAL_TIME || key == "ARRIVAL_TIME"
}

impl AppendBindings {
    /// Resolve `columns` reported by the server against caller `names`.
    pub fn resolve<S: AsRef<str>>(columns: &[ColumnDesc], names: &[S]) -> Result<AppendBindings, EncodeError> {
        span!("append_bindings", columns = columns.len(), names = names.len());
        let mut by_name = HashMap::with_capacity(names.len());
        let mut arrival_arg = None;

        for (idx, name) in names.iter().enumerate() {
            let name = name.as_ref();
            let key = normalize_identifier(name);
            if key.is_empty() {
                continue;
            }
            if is_arrival_alias(&key) {
                arrival_arg = Some(idx);
            }
            if by_name.insert(key, idx).is_some() {
                return Err(EncodeError::new(format!("duplicate append column {name}")));
            }
        }

        let mut matched = vec![false; names.len()];
        let bindings = columns
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let key = normalize_identifier(&col.name);
                if (idx == 0 && key.is_empty()) || key == ARRIVAL_TIME {
                    return Binding::Arrival;
                }
                match by_name.get(&key) {
                    Some(&arg) if !key.is_empty() => {
                        matched[arg] = true;
                        Binding::Arg(arg)
                    }
                    _ => Binding::Null,
                }
            })
            .collect();

        for (idx, name) in names.iter().enumerate() {
            let key = normalize_identifier(name.as_ref());
            if key.is_empty() || is_arrival_alias(&key) || matched[idx] {
                continue;
            }
            return Err(EncodeError::new(format!(
                "append column {} is not accepted by server metadata",
                name.as_ref()
            )));
        }

        Ok(Self { columns: bindings, arrival_arg })
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.columns
    }

    pub fn arrival_arg(&self) -> Option<usize> {
        self.arrival_arg
    }
}

/// Encode one append row.
pub fn encode_row(
    columns: &[ColumnDesc],
    bindings: &AppendBindings,
    args: &[Value],
    endian: Endian,
) -> Result<Bytes, EncodeError> {
    let null_len = match columns.len() {
        0 => 0,
        n => n / 8 + 1,
    };

    let mut row = BytesMut::with_capacity(64 + null_len);
    row.put_u8(0);
    row.put_u32_by(null_len.to_u32(), endian);
    let null_at = row.len();
    row.put_zeroes(null_len);

    let arrival = match bindings.arrival_arg.and_then(|e| args.get(e)) {
        Some(value) if !value.is_null() => value
            .to_datetime()
            .map_err(|e| e.within("invalid arrival time"))?,
        _ => 0,
    };

    for (idx, col) in columns.iter().enumerate() {
        let binding = bindings.columns.get(idx).copied().unwrap_or(Binding::Null);
        let value = match binding {
            Binding::Arrival => {
                row.put_u64_by(arrival as u64, endian);
                continue;
            }
            Binding::Arg(arg) => args.get(arg).filter(|e| !e.is_null()),
            Binding::Null => None,
        };

        let Some(value) = value else {
            row[null_at + idx / 8] |= 1 << (7 - idx % 8);
            continue;
        };

        encode_field(&mut row, col, value, endian)
            .map_err(|e| e.within(format_args!("append column {}", col.name)))?;
    }

    Ok(row.freeze())
}

fn encode_field(buf: &mut BytesMut, col: &ColumnDesc, value: &Value, endian: Endian) -> Result<(), EncodeError> {
    let range = |name: &str| EncodeError::new(format!("out of {name} range: {value}"));

    match col.cmd_type {
        CmdType::BOOL => buf.put_u16_by(value.to_bool()? as u16, endian),
        CmdType::INT16 => {
            let v: i16 = narrow(value.to_i64()?, "int16").map_err(|_| range("int16"))?;
            buf.put_u16_by(v as u16, endian);
        }
        CmdType::UINT16 => {
            let v: u16 = narrow(value.to_i64()?, "uint16").map_err(|_| range("uint16"))?;
            buf.put_u16_by(v, endian);
        }
        CmdType::INT32 => {
            let v: i32 = narrow(value.to_i64()?, "int32").map_err(|_| range("int32"))?;
            buf.put_u32_by(v as u32, endian);
        }
        CmdType::UINT32 => {
            let v: u32 = narrow(value.to_i64()?, "uint32").map_err(|_| range("uint32"))?;
            buf.put_u32_by(v, endian);
        }
        CmdType::INT64 => buf.put_u64_by(value.to_i64()? as u64, endian),
        CmdType::UINT64 => {
            let v: u64 = narrow(value.to_i64()?, "uint64").map_err(|_| range("uint64"))?;
            buf.put_u64_by(v, endian);
        }
        CmdType::FLT32 => buf.put_u32_by((value.to_f64()? as f32).to_bits(), endian),
        CmdType::FLT64 => buf.put_u64_by(value.to_f64()?.to_bits(), endian),
        CmdType::DATE => buf.put_u64_by(value.to_datetime()? as u64, endian),
        CmdType::IPV4 => {
            let ip = match value.to_ip()? {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(ip) => ip
                    .to_ipv4_mapped()
                    .ok_or_else(|| EncodeError::new(format!("invalid ipv4 value {value}")))?,
            };
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        CmdType::IPV6 => {
            let ip = match value.to_ip()? {
                IpAddr::V4(ip) => ip.to_ipv6_mapped(),
                IpAddr::V6(ip) => ip,
            };
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
        CmdType::BINARY | CmdType::BLOB => put_var(buf, &value.to_binary()?, endian),
        CmdType::NUL => {}
        ty if ty.is_variable() => put_var(buf, &value.to_text(), endian),
        ty => return Err(EncodeError::new(format!("unsupported append column type {}", ty.0))),
    }

    Ok(())
}

fn put_var(buf: &mut BytesMut, data: &[u8], endian: Endian) {
    buf.put_u32_by(data.len().to_u32(), endian);
    buf.put_slice(data);
}
