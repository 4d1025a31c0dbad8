#![forbid(unsafe_code)]
//! Encoding, varint, and buffer utilities shared by keys, tokens and records.

pub mod ord {
    //! Order-preserving encoders for numeric keys and tokens.

    use crate::types::{Result, UmbraError};

    const U64_LEN: usize = core::mem::size_of::<u64>();

    /// Length of a sign-prefixed integer encoding.
    pub const SIGNED_INT_LEN: usize = 1 + U64_LEN;

    /// Appends `v` in big-endian order.
    pub fn put_u64_be(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes a big-endian u64 from the head of `src`.
    pub fn get_u64_be(src: &[u8]) -> Result<u64> {
        let head: [u8; U64_LEN] = src
            .get(..U64_LEN)
            .and_then(|head| head.try_into().ok())
            .ok_or(UmbraError::Corruption("u64 field truncated"))?;
        Ok(u64::from_be_bytes(head))
    }

    /// Encodes an i64 as a sign byte (`0` negative, `1` otherwise) followed by its
    /// big-endian two's-complement bytes. Negative numbers sort before positive ones
    /// and both halves keep numeric order.
    pub fn put_signed_int(dst: &mut Vec<u8>, v: i64) {
        dst.push(u8::from(v >= 0));
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes an integer written by [`put_signed_int`].
    pub fn get_signed_int(src: &[u8]) -> Result<i64> {
        if src.len() < SIGNED_INT_LEN {
            return Err(UmbraError::Corruption("signed int token truncated"));
        }
        let value = get_u64_be(&src[1..])? as i64;
        let expected_sign = u8::from(value >= 0);
        if src[0] != expected_sign {
            return Err(UmbraError::Corruption("signed int token sign byte mismatch"));
        }
        Ok(value)
    }
}

pub mod var {
    //! Unsigned varints.

    use crate::types::{Result, UmbraError};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(UmbraError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = u64::from(byte & 0x7f);
            if i == 9 && payload > 1 {
                return Err(UmbraError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(UmbraError::Corruption("varint longer than 10 bytes"))
    }
}

pub mod buf {
    //! A slice-backed cursor for parsing records.

    use core::fmt;

    use super::var;
    use crate::types::{Result, UmbraError};

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, failing with corruption on overread.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or(UmbraError::Corruption("record field runs past end of buffer"))?;
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads a single byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads an unsigned varint.
        pub fn varint(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Reads a varint length prefix followed by that many bytes.
        pub fn len_prefixed(&mut self) -> Result<&'a [u8]> {
            let len = usize::try_from(self.varint()?)
                .map_err(|_| UmbraError::Corruption("length prefix exceeds usize"))?;
            self.take(len)
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }
    }

    /// Appends a varint length prefix followed by `bytes`.
    pub fn put_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
        var::encode_u64(bytes.len() as u64, out);
        out.extend_from_slice(bytes);
    }

    impl fmt::Debug for Cursor<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{buf::Cursor, ord, var};
    use proptest::prelude::*;

    #[test]
    fn signed_int_matches_reference_bytes() {
        let mut pos = Vec::new();
        ord::put_signed_int(&mut pos, 10);
        assert_eq!(pos, vec![0x1, 0, 0, 0, 0, 0, 0, 0, 0xa]);
        let mut neg = Vec::new();
        ord::put_signed_int(&mut neg, -10);
        assert_eq!(neg, vec![0x0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xf6]);
        assert!(neg < pos);
        assert_eq!(ord::get_signed_int(&neg).unwrap(), -10);
    }

    #[test]
    fn signed_int_rejects_bad_sign_byte() {
        let mut buf = Vec::new();
        ord::put_signed_int(&mut buf, 5);
        buf[0] = 0;
        assert!(ord::get_signed_int(&buf).is_err());
        assert!(ord::get_signed_int(&buf[..4]).is_err());
    }

    #[test]
    fn varint_roundtrip_edges() {
        for v in [0u64, 127, 128, u64::MAX] {
            let mut buf = Vec::new();
            var::encode_u64(v, &mut buf);
            let mut off = 0;
            assert_eq!(var::decode_u64(&buf, &mut off).unwrap(), v);
            assert_eq!(off, buf.len());
        }
    }

    #[test]
    fn varint_decode_rejects_truncated_and_long() {
        let mut off = 0;
        assert!(var::decode_u64(&[0x80], &mut off).is_err());
        off = 0;
        assert!(var::decode_u64(&[0x81; 11], &mut off).is_err());
    }

    #[test]
    fn cursor_take_fails_on_overread() {
        let mut cur = Cursor::new(&[1, 2, 3]);
        assert!(cur.take(4).is_err());
        assert_eq!(cur.take(2).unwrap(), &[1, 2]);
        assert_eq!(cur.remaining(), 1);
    }

    proptest! {
        #[test]
        fn signed_int_order_matches_numeric_order(a in any::<i64>(), b in any::<i64>()) {
            let mut ea = Vec::new();
            let mut eb = Vec::new();
            ord::put_signed_int(&mut ea, a);
            ord::put_signed_int(&mut eb, b);
            prop_assert_eq!(ea.cmp(&eb), a.cmp(&b));
            prop_assert_eq!(ord::get_signed_int(&ea).unwrap(), a);
        }
    }
}
