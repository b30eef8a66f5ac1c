//! Packet framing.
//!
//! ```text
//! [reserved=0:u8 | adds:u16 | protocol:u8 | flag:2 len:30 | stmt_id:u32 | pad:u32]
//! ```
//!
//! Header fields are big endian regardless of the server endian.
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::ProtocolError;
use crate::{Result, common::verbose, ext::UsizeExt};

pub const HEADER_LEN: usize = 16;

/// Single packet message, or the last packet of one.
pub const FLAG_SINGLE: u8 = 0;
pub const FLAG_FIRST: u8 = 1;
pub const FLAG_MIDDLE: u8 = 2;
pub const FLAG_LAST: u8 = 3;

const LEN_MASK: u32 = 0x3fff_ffff;

/// Decoded packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub adds: u16,
    pub protocol: u8,
    pub flag: u8,
    pub len: u32,
    pub stmt_id: u32,
}

impl PacketHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(0);
        buf.put_u16(self.adds);
        buf.put_u8(self.protocol);
        buf.put_u32(u32::from(self.flag & 0b11) << 30 | (self.len & LEN_MASK));
        buf.put_u32(self.stmt_id);
        buf.put_u32(0);
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> PacketHeader {
        let flag_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        PacketHeader {
            adds: u16::from_be_bytes([buf[1], buf[2]]),
            protocol: buf[3],
            flag: (flag_len >> 30) as u8,
            len: flag_len & LEN_MASK,
            stmt_id: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}

/// Write one framed packet.
pub fn put_packet(buf: &mut BytesMut, protocol: u8, stmt_id: u32, adds: u16, flag: u8, body: &[u8]) {
    buf.reserve(HEADER_LEN + body.len());
    PacketHeader { adds, protocol, flag, len: body.len().to_u32(), stmt_id }.encode(buf);
    buf.put_slice(body);
}

/// A complete, reassembled message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub protocol: u8,
    pub stmt_id: u32,
    pub adds: u16,
    pub body: Bytes,
}

/// Continuation state machine for a message in progress.
#[derive(Debug, Default)]
pub struct Reassembly {
    head: Option<PacketHeader>,
    body: BytesMut,
}

impl Reassembly {
    /// Feed one packet, returns the complete message once the terminating flag is seen.
    pub fn push(&mut self, header: PacketHeader, body: &[u8]) -> Result<Option<Packet>, ProtocolError> {
        let current = self.head.map(|head| (head.protocol, head.flag));
        match (current, header.flag) {
            (None, FLAG_SINGLE) => {
                return Ok(Some(Packet {
                    protocol: header.protocol,
                    stmt_id: header.stmt_id,
                    adds: header.adds,
                    body: Bytes::copy_from_slice(body),
                }))
            }
            (None, FLAG_FIRST) => {
                self.head = Some(header);
                self.body.clear();
                self.body.extend_from_slice(body);
                return Ok(None)
            }
            (None, found) => return Err(ProtocolError::Continuation { prev: None, found }),
            (Some((protocol, _)), FLAG_MIDDLE | FLAG_LAST) => {
                if protocol != header.protocol {
                    return Err(ProtocolError::ProtocolChanged {
                        expect: protocol,
                        found: header.protocol,
                    });
                }
            }
            (Some((_, prev)), found) => {
                return Err(ProtocolError::Continuation { prev: Some(prev), found })
            }
        }

        self.body.extend_from_slice(body);

        if header.flag == FLAG_MIDDLE {
            if let Some(head) = self.head.as_mut() {
                head.flag = FLAG_MIDDLE;
            }
            return Ok(None)
        }

        let Some(head) = self.head.take() else {
            return Err(ProtocolError::Continuation { prev: None, found: header.flag });
        };

        Ok(Some(Packet {
            protocol: head.protocol,
            stmt_id: head.stmt_id,
            adds: head.adds,
            body: self.body.split().freeze(),
        }))
    }
}

/// Read packets until a whole message is reassembled.
pub async fn read_packet<R: AsyncRead + Unpin>(io: &mut R) -> Result<Packet> {
    let mut state = Reassembly::default();
    let mut header = [0u8; HEADER_LEN];
    let mut body = Vec::new();

    loop {
        io.read_exact(&mut header).await?;
        let head = PacketHeader::decode(&header);

        body.resize(head.len as usize, 0);
        io.read_exact(&mut body).await?;

        verbose!(
            protocol = head.protocol, stmt_id = head.stmt_id,
            flag = head.flag, len = head.len, "(B)Packet"
        );

        if let Some(packet) = state.push(head, &body)? {
            return Ok(packet)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn header(protocol: u8, flag: u8, len: u32) -> PacketHeader {
        PacketHeader { adds: 0, protocol, flag, len, stmt_id: 3 }
    }

    #[test]
    fn header_layout() {
        let mut buf = BytesMut::new();
        put_packet(&mut buf, 8, 0x0102_0304, 0xabcd, FLAG_LAST, b"xyz");
        assert_eq!(
            &buf[..HEADER_LEN],
            &[0, 0xab, 0xcd, 8, 0xc0, 0, 0, 3, 1, 2, 3, 4, 0, 0, 0, 0]
        );
        assert_eq!(&buf[HEADER_LEN..], b"xyz");

        let head = PacketHeader::decode(buf[..HEADER_LEN].try_into().unwrap());
        assert_eq!(head, PacketHeader { adds: 0xabcd, protocol: 8, flag: 3, len: 3, stmt_id: 0x0102_0304 });
    }

    #[test]
    fn reassemble_continuation() {
        let mut state = Reassembly::default();
        assert!(state.push(header(9, FLAG_FIRST, 2), b"ab").unwrap().is_none());
        assert!(state.push(header(9, FLAG_MIDDLE, 2), b"cd").unwrap().is_none());
        assert!(state.push(header(9, FLAG_MIDDLE, 1), b"e").unwrap().is_none());
        let packet = state.push(header(9, FLAG_LAST, 1), b"f").unwrap().unwrap();
        assert_eq!(packet.protocol, 9);
        assert_eq!(packet.stmt_id, 3);
        assert_eq!(&packet.body[..], b"abcdef");

        // state is reusable after completion
        let packet = state.push(header(7, FLAG_SINGLE, 1), b"z").unwrap().unwrap();
        assert_eq!(&packet.body[..], b"z");
    }

    #[test]
    fn reject_invalid_transitions() {
        let mut state = Reassembly::default();
        assert!(state.push(header(9, FLAG_MIDDLE, 0), b"").is_err());
        let mut state = Reassembly::default();
        assert!(state.push(header(9, FLAG_LAST, 0), b"").is_err());

        let mut state = Reassembly::default();
        state.push(header(9, FLAG_FIRST, 0), b"").unwrap();
        let err = state.push(header(9, FLAG_SINGLE, 0), b"").unwrap_err();
        assert!(err.is_fatal());

        let mut state = Reassembly::default();
        state.push(header(9, FLAG_FIRST, 0), b"").unwrap();
        assert!(state.push(header(9, FLAG_FIRST, 0), b"").is_err());

        let mut state = Reassembly::default();
        state.push(header(9, FLAG_FIRST, 0), b"").unwrap();
        let err = state.push(header(12, FLAG_LAST, 0), b"").unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolChanged { expect: 9, found: 12 }));
    }

    #[tokio::test]
    async fn read_framed_stream() {
        let mut wire = BytesMut::new();
        put_packet(&mut wire, 9, 1, 0, FLAG_FIRST, &[1; 10]);
        put_packet(&mut wire, 9, 1, 0, FLAG_LAST, &[2; 4]);
        put_packet(&mut wire, 10, 5, 7, FLAG_SINGLE, b"");

        let mut io = &wire[..];
        let first = read_packet(&mut io).await.unwrap();
        assert_eq!(first.body.len(), 14);
        assert_eq!(first.body[13], 2);

        let second = read_packet(&mut io).await.unwrap();
        assert_eq!(second, Packet { protocol: 10, stmt_id: 5, adds: 7, body: Bytes::new() });

        assert!(read_packet(&mut io).await.is_err());
    }
}
