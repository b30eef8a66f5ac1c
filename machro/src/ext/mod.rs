//! Endian disciplined buffer helpers.
//!
//! The wire mixes byte orders:
//!
//! - packet headers and bind payloads are big endian,
//! - marshal unit headers are little endian,
//! - append row payloads follow the [`Endian`] declared by the server.
//!
//! Every read and write goes through the helpers here, native endian is
//! never used.
use bytes::BufMut;

/// Byte order declared by the server at connect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// `0` is little endian, anything else is big endian.
    pub const fn from_wire(value: u32) -> Endian {
        match value {
            0 => Endian::Little,
            _ => Endian::Big,
        }
    }
}

/// Integer conversion for wire length fields.
pub trait UsizeExt {
    /// Length is `usize` in rust, while the wire want `u32`,
    /// this will panic when overflow instead of wrapping.
    fn to_u32(self) -> u32;
    /// Length is `usize` in rust, while the wire want `u16`,
    /// this will panic when overflow instead of wrapping.
    fn to_u16(self) -> u16;
    /// Round up to the next multiple of 8.
    fn align8(self) -> usize;
}

impl UsizeExt for usize {
    fn to_u32(self) -> u32 {
        self.try_into().expect("message size too large for protocol")
    }

    fn to_u16(self) -> u16 {
        self.try_into().expect("message size too large for protocol")
    }

    fn align8(self) -> usize {
        (self + 7) & !7
    }
}

/// Server endian aware write in [`BufMut`].
pub trait BufMutExt: BufMut {
    fn put_u16_by(&mut self, value: u16, endian: Endian) {
        match endian {
            Endian::Little => self.put_u16_le(value),
            Endian::Big => self.put_u16(value),
        }
    }

    fn put_u32_by(&mut self, value: u32, endian: Endian) {
        match endian {
            Endian::Little => self.put_u32_le(value),
            Endian::Big => self.put_u32(value),
        }
    }

    fn put_u64_by(&mut self, value: u64, endian: Endian) {
        match endian {
            Endian::Little => self.put_u64_le(value),
            Endian::Big => self.put_u64(value),
        }
    }

    /// Write `len` zero bytes.
    fn put_zeroes(&mut self, len: usize) {
        self.put_bytes(0, len);
    }
}

impl<B: BufMut + ?Sized> BufMutExt for B { }

/// Fixed size reads from a slice, returns [`None`] when the slice is short.
pub trait SliceExt {
    fn be_u16(&self) -> Option<u16>;
    fn be_u32(&self) -> Option<u32>;
    fn be_u64(&self) -> Option<u64>;
    fn le_u32(&self) -> Option<u32>;
    fn le_u64(&self) -> Option<u64>;
    /// Little endian unsigned integer of whatever width the slice has,
    /// widest first.
    fn le_uint(&self) -> Option<u64>;
}

macro_rules! read {
    ($me:ident, $ty:ty, $from:ident) => {{
        let bytes = $me.get(..size_of::<$ty>())?;
        let mut array = [0u8; size_of::<$ty>()];
        array.copy_from_slice(bytes);
        Some(<$ty>::$from(array))
    }};
}

impl SliceExt for [u8] {
    fn be_u16(&self) -> Option<u16> {
        read!(self, u16, from_be_bytes)
    }

    fn be_u32(&self) -> Option<u32> {
        read!(self, u32, from_be_bytes)
    }

    fn be_u64(&self) -> Option<u64> {
        read!(self, u64, from_be_bytes)
    }

    fn le_u32(&self) -> Option<u32> {
        read!(self, u32, from_le_bytes)
    }

    fn le_u64(&self) -> Option<u64> {
        read!(self, u64, from_le_bytes)
    }

    fn le_uint(&self) -> Option<u64> {
        match self.len() {
            8.. => self.le_u64(),
            4.. => self.le_u32().map(u64::from),
            2.. => read!(self, u16, from_le_bytes).map(u64::from),
            1 => Some(u64::from(self[0])),
            0 => None,
        }
    }
}

/// Helper trait to [`Display`][std::fmt::Display] bytes.
pub trait FmtExt {
    /// Lossy [`Display`][std::fmt::Display] bytes.
    fn lossy(&self) -> LossyFmt<'_>;
}

/// Lossy [`Display`][std::fmt::Display] implementation for bytes.
pub struct LossyFmt<'a>(pub &'a [u8]);

impl FmtExt for [u8] {
    fn lossy(&self) -> LossyFmt<'_> {
        LossyFmt(self)
    }
}

impl std::fmt::Display for LossyFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LossyFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b\"{self}\"")
    }
}
