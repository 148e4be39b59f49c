//! Small helpers for encoding and decoding the fixed-layout payloads used throughout
//! the protocol.
//!
//! Every opcode handler in [`crate::command_center`] builds a payload of a few
//! hand-counted bytes and every codec pass in [`crate::codec`] walks a frame byte by
//! byte. [`ByteReader`] and [`ByteWriter`] exist so that those buffers are read and
//! written through a handful of checked primitives instead of raw indexing, so a
//! length mistake becomes an [`Error::Eof`](crate::Error::Eof) instead of a panic.

use crate::error::{Error, Result};

/// Cursor over a borrowed byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn bytes_left(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        if self.buf.len() < n {
            return Err(Error::Eof);
        }
        self.buf = &self.buf[n..];
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let (&b, rest) = self.buf.split_first().ok_or(Error::Eof)?;
        self.buf = rest;
        Ok(b)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let arr = self.read_array::<2>()?;
        Ok(u16::from_le_bytes(arr))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        let arr = self.read_array::<2>()?;
        Ok(u16::from_be_bytes(arr))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.buf.len() < N {
            return Err(Error::Eof);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[..N]);
        self.buf = &self.buf[N..];
        Ok(out)
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() < len {
            return Err(Error::Eof);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

/// Append-only byte buffer, used to build frame and payload bytes.
pub struct ByteWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn write_u8(&mut self, b: u8) {
        self.buf.push(b);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u16_be(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let mut buf = Vec::new();
        let mut w = ByteWriter::new(&mut buf);
        w.write_u8(0xAB);
        w.write_u16_le(0x1234);
        w.write_u16_be(0x1234);
        w.write_slice(&[1, 2, 3]);

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u16_le().unwrap(), 0x1234);
        assert_eq!(r.read_u16_be().unwrap(), 0x1234);
        assert_eq!(r.read_slice(3).unwrap(), &[1, 2, 3]);
        assert!(r.is_empty());
    }

    #[test]
    fn eof_on_short_read() {
        let buf = [0u8; 1];
        let mut r = ByteReader::new(&buf);
        assert!(matches!(r.read_u16_le(), Err(Error::Eof)));
    }
}
