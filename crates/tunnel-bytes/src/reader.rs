//! Internal: Declare the Reader type for tunnel-bytes

use crate::{Error, Readable, Result};
use arrayref::array_ref;

/// A cursor for decoding records out of an in-memory byte slice.
///
/// Every method that consumes bytes checks the remaining length first,
/// so a malformed length field produces [`Error::Truncated`] rather
/// than a panic.  Tunnel cells arrive from untrusted peers, and every
/// numeric field we read from them is bounded this way.
///
/// # Examples
///
/// ```
/// use tunnel_bytes::{Reader,Result};
/// // A follow-on fragment header: control byte, message id, length.
/// let rec = [ 0x83, 0x00, 0x00, 0x30, 0x39, 0x00, 0x04, 1, 2, 3, 4 ];
/// let mut r = Reader::from_slice(&rec[..]);
/// assert_eq!(r.take_u8()?, 0x83);
/// assert_eq!(r.take_u32()?, 12345);
/// let len = r.take_u16()? as usize;
/// assert_eq!(r.take(len)?, &[1, 2, 3, 4]);
/// r.should_be_exhausted()?;
/// # Result::Ok(())
/// ```
pub struct Reader<'a> {
    /// The slice we're decoding from.
    b: &'a [u8],
    /// Position of the next byte to read.
    off: usize,
}

impl<'a> Reader<'a> {
    /// Construct a new Reader over a slice of bytes.
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Reader { b: slice, off: 0 }
    }
    /// Construct a new Reader over a [`bytes::Bytes`] object.
    pub fn from_bytes(b: &'a bytes::Bytes) -> Self {
        Self::from_slice(b.as_ref())
    }
    /// Return the length of the underlying slice, read or not.
    pub fn total_len(&self) -> usize {
        self.b.len()
    }
    /// Return the number of bytes that have not been read yet.
    pub fn remaining(&self) -> usize {
        self.b.len() - self.off
    }
    /// Return the number of bytes that have been read so far.
    pub fn consumed(&self) -> usize {
        self.off
    }
    /// Consume this reader and return the unread part of its slice.
    pub fn into_rest(self) -> &'a [u8] {
        &self.b[self.off..]
    }
    /// Skip `n` bytes.
    ///
    /// Returns Err(Error::Truncated) and leaves the reader unchanged
    /// if fewer than `n` bytes remain.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(Error::Truncated);
        }
        self.off += n;
        Ok(())
    }
    /// Return Ok if every byte has been read, and
    /// Err(Error::ExtraneousBytes) otherwise.
    pub fn should_be_exhausted(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::ExtraneousBytes);
        }
        Ok(())
    }
    /// Limit this reader so that at most `n` more bytes can be read.
    pub fn truncate(&mut self, n: usize) {
        if n < self.remaining() {
            self.b = &self.b[..self.off + n];
        }
    }
    /// Return the next `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated);
        }
        Ok(&self.b[self.off..(self.off + n)])
    }
    /// Consume and return the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let b = self.peek(n)?;
        self.off += n;
        Ok(b)
    }
    /// Consume the next `N` bytes and return them as an array.
    ///
    /// ```
    /// use tunnel_bytes::{Reader,Result};
    /// let mut r = Reader::from_slice(b"hashhash!");
    /// let h: [u8; 8] = r.take_array()?;
    /// assert_eq!(&h, b"hashhash");
    /// assert_eq!(r.remaining(), 1);
    /// # Result::Ok(())
    /// ```
    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let b = self.take(N)?;
        let mut out = [0_u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }
    /// Consume and return a u8.
    pub fn take_u8(&mut self) -> Result<u8> {
        let b = self.take(1)?;
        Ok(b[0])
    }
    /// Consume and return a big-endian u16.
    pub fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes(*array_ref![b, 0, 2]))
    }
    /// Consume and return a big-endian u32.
    pub fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes(*array_ref![b, 0, 4]))
    }
    /// Consume and return a big-endian u64.
    pub fn take_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(*array_ref![b, 0, 8]))
    }
    /// Consume bytes up to the first byte equal to `term`, and return
    /// them without the terminator.
    ///
    /// The reader is left just past the terminator.  If there is no
    /// terminator, returns Err(Error::Truncated) and consumes nothing.
    ///
    /// This is how cell padding is skipped: padding bytes are nonzero,
    /// and a single zero byte marks the start of the fragment records.
    pub fn take_until(&mut self, term: u8) -> Result<&'a [u8]> {
        let pos = self.b[self.off..]
            .iter()
            .position(|b| *b == term)
            .ok_or(Error::Truncated)?;
        let result = self.take(pos)?;
        self.advance(1)?;
        Ok(result)
    }
    /// Decode a [`Readable`] from this reader.
    ///
    /// On failure, the reader is rewound to where it started.
    pub fn extract<E: Readable>(&mut self) -> Result<E> {
        let off_orig = self.off;
        let result = E::take_from(self);
        if result.is_err() {
            self.off = off_orig;
        }
        result
    }
}
