//! Marshal units.
//!
//! A unit is `[id:u32 | type:u32 | payload]` in little endian. Fixed size units
//! carry their value in the 8 bytes after the header, variable units carry a
//! `u64` length followed by the payload padded to 8 bytes.
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::{MAX_BODY, ProtocolError, packet};
use crate::ext::{SliceExt, UsizeExt};

pub const UNIT_HEADER_LEN: usize = 16;

/// Marshal unit type tags.
pub mod unit_type {
    pub const STRING: u32 = 0x02;
    pub const BINARY: u32 = 0x03;
    pub const SCHAR: u32 = 0x04;
    pub const UCHAR: u32 = 0x05;
    pub const SSHORT: u32 = 0x06;
    pub const USHORT: u32 = 0x07;
    pub const SINT: u32 = 0x08;
    pub const UINT: u32 = 0x09;
    pub const SLONG: u32 = 0x0a;
    pub const ULONG: u32 = 0x0b;
    pub const DATE: u32 = 0x0c;
    pub const ROWS: u32 = 0x0d;
    pub const TNUM: u32 = 0xf1;
    pub const NUM: u32 = 0xf2;

    /// Types with a length prefixed, padded payload.
    pub const fn is_variable(ty: u32) -> bool {
        matches!(ty, STRING | BINARY | DATE | ROWS | TNUM | NUM)
    }

    /// Value width of fixed types.
    pub const fn fixed_width(ty: u32) -> usize {
        match ty {
            SCHAR | UCHAR => 1,
            SSHORT | USHORT => 2,
            SINT | UINT => 4,
            _ => 8,
        }
    }
}

/// Encode units of one message, spilling into more packets past [`MAX_BODY`].
#[derive(Debug)]
pub struct MarshalWriter {
    protocol: u8,
    stmt_id: u32,
    adds: u16,
    current: BytesMut,
    bodies: Vec<Bytes>,
}

impl MarshalWriter {
    pub fn new(protocol: u8, stmt_id: u32) -> MarshalWriter {
        Self::with_adds(protocol, stmt_id, 0)
    }

    pub fn with_adds(protocol: u8, stmt_id: u32, adds: u16) -> MarshalWriter {
        Self { protocol, stmt_id, adds, current: BytesMut::new(), bodies: vec![] }
    }

    pub fn add_string(&mut self, id: u32, value: &str) -> &mut Self {
        self.add_variable(id, unit_type::STRING, value.as_bytes())
    }

    pub fn add_binary(&mut self, id: u32, value: &[u8]) -> &mut Self {
        self.add_variable(id, unit_type::BINARY, value)
    }

    pub fn add_u32(&mut self, id: u32, value: u32) -> &mut Self {
        self.add_fixed(id, unit_type::UINT, u64::from(value))
    }

    pub fn add_i32(&mut self, id: u32, value: i32) -> &mut Self {
        self.add_fixed(id, unit_type::SINT, u64::from(value as u32))
    }

    pub fn add_u64(&mut self, id: u32, value: u64) -> &mut Self {
        self.add_fixed(id, unit_type::ULONG, value)
    }

    pub fn add_i64(&mut self, id: u32, value: i64) -> &mut Self {
        self.add_fixed(id, unit_type::SLONG, value as u64)
    }

    /// Fixed value occupy the low bytes of the 8 byte slot, little endian.
    fn add_fixed(&mut self, id: u32, ty: u32, value: u64) -> &mut Self {
        self.reserve(UNIT_HEADER_LEN);
        self.current.put_u32_le(id);
        self.current.put_u32_le(ty);
        self.current.put_u64_le(value);
        self
    }

    pub fn add_variable(&mut self, id: u32, ty: u32, payload: &[u8]) -> &mut Self {
        let padded = payload.len().align8();
        let unit_len = UNIT_HEADER_LEN + padded;

        let put = |buf: &mut BytesMut| {
            buf.put_u32_le(id);
            buf.put_u32_le(ty);
            buf.put_u64_le(payload.len() as u64);
            buf.put_slice(payload);
            buf.put_bytes(0, padded - payload.len());
        };

        if unit_len > MAX_BODY {
            self.flush_current();
            let mut body = BytesMut::with_capacity(unit_len);
            put(&mut body);
            self.bodies.push(body.freeze());
            return self
        }

        self.reserve(unit_len);
        put(&mut self.current);
        self
    }

    fn reserve(&mut self, unit_len: usize) {
        if self.current.len() + unit_len > MAX_BODY {
            self.flush_current();
        }
    }

    fn flush_current(&mut self) {
        if !self.current.is_empty() {
            self.bodies.push(self.current.split().freeze());
        }
    }

    /// Frame every body into packets, returns the bytes ready to be written.
    pub fn finish(mut self) -> Bytes {
        self.flush_current();
        if self.bodies.is_empty() {
            self.bodies.push(Bytes::new());
        }

        let total = self.bodies.len();
        let size = self.bodies.iter().map(|e| e.len() + packet::HEADER_LEN).sum();
        let mut buf = BytesMut::with_capacity(size);

        for (i, body) in self.bodies.iter().enumerate() {
            let flag = match (total, i) {
                (1, _) => packet::FLAG_SINGLE,
                (_, 0) => packet::FLAG_FIRST,
                (_, i) if i == total - 1 => packet::FLAG_LAST,
                _ => packet::FLAG_MIDDLE,
            };
            packet::put_packet(&mut buf, self.protocol, self.stmt_id, self.adds, flag, body);
        }

        buf.freeze()
    }
}

/// One decoded unit, `data` is the unpadded payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unit {
    pub id: u32,
    pub ty: u32,
    pub data: Bytes,
}

impl Unit {
    /// Full 8 byte little endian value.
    pub fn as_u64(&self) -> Option<u64> {
        self.data.le_u64()
    }

    /// Little endian unsigned value of any width.
    pub fn as_uint(&self) -> Option<u64> {
        self.data.le_uint()
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.data.le_u32().map(|e| e as i32)
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Sequential unit reader over a message body.
#[derive(Debug)]
pub struct MarshalReader {
    buf: Bytes,
    off: usize,
}

impl MarshalReader {
    pub fn new(buf: Bytes) -> MarshalReader {
        Self { buf, off: 0 }
    }

    /// Returns [`None`] once the body is exhausted.
    pub fn next_unit(&mut self) -> Result<Option<Unit>, ProtocolError> {
        let len = self.buf.len();
        let off = self.off;
        if off >= len {
            return Ok(None);
        }
        if off + UNIT_HEADER_LEN > len {
            return Err(ProtocolError::IncompleteHeader);
        }

        let head = &self.buf[off..];
        let (Some(id), Some(ty)) = (head.le_u32(), head[4..].le_u32()) else {
            return Err(ProtocolError::IncompleteHeader);
        };
        let start = off + UNIT_HEADER_LEN;

        if unit_type::is_variable(ty) {
            let size = head[8..].le_u64().unwrap_or_default() as usize;
            let end = start.saturating_add(size.align8());
            if end > len {
                return Err(ProtocolError::Overflow { ty, off, need: end, len });
            }
            self.off = end;
            return Ok(Some(Unit { id, ty, data: self.buf.slice(start..start + size) }));
        }

        let need = off + 8 + unit_type::fixed_width(ty);
        if need > len {
            return Err(ProtocolError::Overflow { ty, off, need, len });
        }
        self.off = start;
        Ok(Some(Unit { id, ty, data: self.buf.slice(off + 8..need) }))
    }
}

/// Units of a message grouped by id, in arrival order.
#[derive(Debug, Default)]
pub struct Units {
    map: HashMap<u32, Vec<Unit>>,
}

impl Units {
    pub fn collect(body: Bytes) -> Result<Units, ProtocolError> {
        let mut reader = MarshalReader::new(body);
        let mut map = HashMap::<u32, Vec<Unit>>::new();
        while let Some(unit) = reader.next_unit()? {
            map.entry(unit.id).or_default().push(unit);
        }
        Ok(Units { map })
    }

    pub fn first(&self, id: u32) -> Option<&Unit> {
        self.map.get(&id).and_then(|e| e.first())
    }

    pub fn all(&self, id: u32) -> &[Unit] {
        self.map.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// First unit of `id` as lossy string, empty when absent.
    pub fn string(&self, id: u32) -> String {
        self.first(id).map(Unit::to_string_lossy).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::packet::{HEADER_LEN, PacketHeader};

    fn bodies(mut wire: &[u8]) -> Vec<(PacketHeader, Vec<u8>)> {
        let mut out = vec![];
        while !wire.is_empty() {
            let head = PacketHeader::decode(wire[..HEADER_LEN].try_into().unwrap());
            let end = HEADER_LEN + head.len as usize;
            out.push((head, wire[HEADER_LEN..end].to_vec()));
            wire = &wire[end..];
        }
        out
    }

    #[test]
    fn unit_layout() {
        let mut w = MarshalWriter::new(0, 0);
        w.add_u32(0x41, 7).add_string(0x02, "CLI");
        let packets = bodies(&w.finish());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0.flag, packet::FLAG_SINGLE);

        let body = &packets[0].1;
        assert_eq!(body.len(), 16 + 16 + 8);
        assert_eq!(&body[..16], &[0x41, 0, 0, 0, 9, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&body[16..32], &[2, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&body[32..], b"CLI\0\0\0\0\0");
    }

    #[test]
    fn unit_read_back() {
        let mut w = MarshalWriter::new(8, 4);
        w.add_string(0x40, "SELECT 1 FROM DUAL")
            .add_u64(0x22, 4)
            .add_i32(200, -5)
            .add_binary(0x52, &[]);
        let packets = bodies(&w.finish());
        let units = Units::collect(Bytes::from(packets[0].1.clone())).unwrap();

        assert_eq!(units.string(0x40), "SELECT 1 FROM DUAL");
        assert_eq!(units.first(0x22).and_then(Unit::as_u64), Some(4));
        assert_eq!(units.first(200).and_then(Unit::as_i32), Some(-5));
        assert_eq!(units.first(0x52).map(|e| e.data.len()), Some(0));
        assert!(units.first(0x99).is_none());
        assert!(units.all(0x99).is_empty());
    }

    #[test]
    fn multimap_keeps_order() {
        let mut w = MarshalWriter::new(6, 1);
        w.add_string(0x26, "A").add_u64(0x27, 1).add_string(0x26, "B").add_u64(0x27, 2);
        let packets = bodies(&w.finish());
        let units = Units::collect(Bytes::from(packets[0].1.clone())).unwrap();
        let names: Vec<_> = units.all(0x26).iter().map(Unit::to_string_lossy).collect();
        assert_eq!(names, ["A", "B"]);
    }

    #[test]
    fn spill_into_packets() {
        let mut w = MarshalWriter::new(12, 9);
        let row = vec![1u8; 40 * 1024];
        w.add_binary(0x23, &row).add_binary(0x23, &row).add_binary(0x23, &row);
        let packets = bodies(&w.finish());
        assert_eq!(packets.len(), 3);
        let flags: Vec<_> = packets.iter().map(|e| e.0.flag).collect();
        assert_eq!(flags, [1, 2, 3]);
        assert!(packets.iter().all(|e| e.1.len() <= MAX_BODY && e.0.stmt_id == 9));
    }

    #[test]
    fn oversized_unit_gets_own_body() {
        let mut w = MarshalWriter::new(7, 1);
        w.add_u64(0x22, 1).add_binary(0x31, &vec![0u8; MAX_BODY + 1]).add_u64(0x51, 2);
        let packets = bodies(&w.finish());
        let lens: Vec<_> = packets.iter().map(|e| e.1.len()).collect();
        assert_eq!(lens, [16, 16 + (MAX_BODY + 1).align8(), 16]);
    }

    #[test]
    fn empty_message() {
        let packets = bodies(&MarshalWriter::new(10, 2).finish());
        assert_eq!(packets.len(), 1);
        assert!(packets[0].1.is_empty());
    }

    #[test]
    fn reader_overflow() {
        let mut body = vec![];
        body.put_u32_le(0x11);
        body.put_u32_le(unit_type::STRING);
        body.put_u64_le(100);
        body.put_slice(b"short");
        let err = MarshalReader::new(body.into()).next_unit().unwrap_err();
        assert!(err.to_string().starts_with("marshal overflow type=2 off=0"));

        let err = MarshalReader::new(Bytes::from_static(&[1, 2, 3])).next_unit().unwrap_err();
        assert_eq!(err.to_string(), "incomplete marshal header");

        let mut body = vec![];
        body.put_u32_le(0x10);
        body.put_u32_le(unit_type::ULONG);
        body.put_u32_le(0);
        assert!(MarshalReader::new(body.into()).next_unit().is_err());
    }
}
