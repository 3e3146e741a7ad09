//! Internal: Declare the Writer trait for tunnel-bytes

use crate::Writeable;

/// A byte-oriented trait for appending to in-memory buffers.
///
/// Unlike std::io::Write, these methods cannot fail: a Writer is a
/// growable buffer, never an IO object.
pub trait Writer {
    /// Append a slice to the end of this writer.
    fn write_all(&mut self, b: &[u8]);

    /// Append a single u8.
    fn write_u8(&mut self, x: u8) {
        self.write_all(&[x])
    }
    /// Append a u16 in big-endian order.
    fn write_u16(&mut self, x: u16) {
        self.write_all(&x.to_be_bytes())
    }
    /// Append a u32 in big-endian order.
    fn write_u32(&mut self, x: u32) {
        self.write_all(&x.to_be_bytes())
    }
    /// Append a u64 in big-endian order.
    fn write_u64(&mut self, x: u64) {
        self.write_all(&x.to_be_bytes())
    }
    /// Append `n` zero bytes.
    fn write_zeros(&mut self, n: usize) {
        for _ in 0..n {
            self.write_u8(0);
        }
    }
    /// Encode a Writeable object onto this writer.
    fn write<E: Writeable + ?Sized>(&mut self, e: &E) {
        e.write_onto(self)
    }
}

impl Writer for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
    fn write_zeros(&mut self, n: usize) {
        let new_len = self.len() + n;
        self.resize(new_len, 0);
    }
}

impl Writer for bytes::BytesMut {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// A Writer that fills a fixed-size slice from a starting offset.
///
/// Tunnel cells are built in place inside a fixed 1024-byte buffer, so
/// writing past the end is a programming error rather than a reason to
/// grow.  Instead of panicking, a `SliceWriter` records the overflow;
/// check it with [`SliceWriter::finish`].
pub struct SliceWriter<'a> {
    /// The buffer being filled.
    buf: &'a mut [u8],
    /// Next position to write.
    off: usize,
    /// Set if a write did not fit.
    overflowed: bool,
}

impl<'a> SliceWriter<'a> {
    /// Create a new writer that begins at `off` within `buf`.
    pub fn new(buf: &'a mut [u8], off: usize) -> Self {
        let overflowed = off > buf.len();
        SliceWriter {
            buf,
            off,
            overflowed,
        }
    }
    /// Return the offset of the next byte to be written.
    pub fn offset(&self) -> usize {
        self.off
    }
    /// Return the offset reached, or an error if anything overflowed.
    pub fn finish(self) -> crate::Result<usize> {
        if self.overflowed {
            Err(crate::Error::OutOfRange("write past end of buffer"))
        } else {
            Ok(self.off)
        }
    }
}

impl<'a> Writer for SliceWriter<'a> {
    fn write_all(&mut self, b: &[u8]) {
        if self.overflowed {
            return;
        }
        let end = self.off + b.len();
        if end > self.buf.len() {
            self.overflowed = true;
            return;
        }
        self.buf[self.off..end].copy_from_slice(b);
        self.off = end;
    }
}
