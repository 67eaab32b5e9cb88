//! A small endian-aware byte cursor with alignment support.
//!
//! This plays the same role as the teacher crate's direct use of
//! `byteorder::ReadBytesExt` over a `std::io::Cursor`, but centralizes
//! short-read detection (`Error::ShortRead`) and adds `align_to`, which
//! Radiotap's per-field alignment rules need and a bare `io::Cursor` does
//! not provide.

use byteorder::{ByteOrder, LE};

use crate::error::{Error, Result};

/// Cursor over an in-memory byte slice.
///
/// Unlike `std::io::Cursor`, reads past the end of the buffer return
/// `Error::ShortRead` rather than a short `Read::read` result, which keeps
/// every decoder in this crate from having to special-case partial reads.
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteCursor { buf, offset: 0 }
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn seek_abs(&mut self, offset: usize) -> Result<()> {
        if offset > self.buf.len() {
            return Err(Error::ShortRead(offset, self.buf.len()));
        }
        self.offset = offset;
        Ok(())
    }

    /// Pads `offset` up to the next multiple of `align` (a no-op if already
    /// aligned). `align` of 1 is always a no-op.
    pub fn align_to(&mut self, align: usize) {
        let remain = self.offset % align;
        if remain != 0 {
            self.offset += align - remain;
        }
    }

    pub fn read_exact(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::ShortRead(n, self.remaining()));
        }
        let slice = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_exact(1)?[0] as i8)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(LE::read_u16(self.read_exact(2)?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(byteorder::BE::read_u16(self.read_exact(2)?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(LE::read_u32(self.read_exact(4)?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        Ok(byteorder::BE::read_u32(self.read_exact(4)?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32> {
        Ok(LE::read_i32(self.read_exact(4)?))
    }

    pub fn read_i32_be(&mut self) -> Result<i32> {
        Ok(byteorder::BE::read_i32(self.read_exact(4)?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        Ok(LE::read_u64(self.read_exact(8)?))
    }

    pub fn read_array6(&mut self) -> Result<[u8; 6]> {
        let s = self.read_exact(6)?;
        let mut out = [0u8; 6];
        out.copy_from_slice(s);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_pads_up() {
        let buf = [0u8; 16];
        let mut c = ByteCursor::new(&buf);
        c.seek_abs(3).unwrap();
        c.align_to(8);
        assert_eq!(c.position(), 8);
        c.align_to(8);
        assert_eq!(c.position(), 8);
    }

    #[test]
    fn short_read_reports_counts() {
        let buf = [1u8, 2, 3];
        let mut c = ByteCursor::new(&buf);
        c.read_exact(3).unwrap();
        match c.read_u16_le().unwrap_err() {
            Error::ShortRead(expected, got) => {
                assert_eq!(expected, 2);
                assert_eq!(got, 0);
            }
            e => panic!("wrong error: {:?}", e),
        }
    }
}
