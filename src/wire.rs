//! Little-endian byte-blob primitives shared by the model and filter codecs.
//!
//! The serialized form keeps every multi-byte field on an 8-byte boundary; padding
//! bytes are written as zero and verified as zero on the way back in, so a
//! serialize/deserialize round trip is byte-identical.

use alloc::vec::Vec;

use crate::error::Error;

const ALIGN: usize = 8;

/// Rounds `n` up to the next 8-byte boundary.
pub(crate) const fn aligned(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Append-only writer producing the blob.
pub(crate) struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Zero-fills up to the next 8-byte boundary.
    pub fn pad(&mut self) {
        while self.buf.len() % ALIGN != 0 {
            self.buf.push(0);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked reader over a serialized blob. Every failure is [`Error::Corrupt`];
/// a reader never panics on hostile input.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.remaining() {
            return Err(Error::Corrupt("truncated blob"));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let bytes = self.get_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn get_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.get_array::<2>()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.get_array::<8>()?))
    }

    /// Consumes padding up to the next 8-byte boundary, insisting it is zero.
    pub fn skip_pad(&mut self) -> Result<(), Error> {
        while self.pos % ALIGN != 0 {
            let byte = self.get_array::<1>()?[0];
            if byte != 0 {
                return Err(Error::Corrupt("nonzero padding"));
            }
        }
        Ok(())
    }
}
