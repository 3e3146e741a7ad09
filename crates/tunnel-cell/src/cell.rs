//! Fixed-size tunnel cells.
//!
//! Every cell is exactly [`CELL_LEN`] bytes:
//!
//! ```text
//!  IV (16) | checksum (4) | nonzero padding | 0x00 | records...
//! ```
//!
//! The records sit at the end of the cell, and the padding fills the
//! gap between the checksum and them.  The checksum is the first four
//! bytes of SHA-256 over the records followed by the IV, which lets the
//! endpoint detect corruption (or a wrong key) before it parses
//! anything.

use rand::{CryptoRng, Rng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tunnel_bytes::Reader;

use crate::frag::FOLLOW_ON_INSTRUCTION_LEN;
use crate::{Error, Result};

/// Length of every tunnel cell.
pub const CELL_LEN: usize = 1024;
/// Length of the IV at the front of a cell.
pub const IV_LEN: usize = 16;
/// Length of the truncated checksum after the IV.
pub const CHECKSUM_LEN: usize = 4;
/// Length of the IV and checksum together.
pub const PREFIX_LEN: usize = IV_LEN + CHECKSUM_LEN;
/// Space available for records when there is no padding: everything but
/// the IV, the checksum, and the zero terminator.
pub const FULL_SIZE: usize = CELL_LEN - PREFIX_LEN - 1;
/// The largest fragment body that can ever fit in a cell.
pub const MAX_FRAGMENT_SIZE: usize = FULL_SIZE - FOLLOW_ON_INSTRUCTION_LEN;
/// The largest number of fragments a single message may use.
pub const MAX_FRAGMENTS: usize = 64;

/// A cell, as a raw array of bytes.
pub type RawCell = [u8; CELL_LEN];

/// Compute the checksum of a cell whose records are `records` and whose
/// IV is `iv`.
pub fn checksum(records: &[u8], iv: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut d = Sha256::new();
    d.update(records);
    d.update(iv);
    let h = d.finalize();
    let mut out = [0_u8; CHECKSUM_LEN];
    out.copy_from_slice(&h[..CHECKSUM_LEN]);
    out
}

/// Build a cell in `cell` around `records`.
///
/// Chooses a random IV, fills the gap with random nonzero padding,
/// writes the terminator, and computes the checksum.
pub fn frame<R: Rng + CryptoRng>(cell: &mut [u8], records: &[u8], rng: &mut R) -> Result<()> {
    if cell.len() != CELL_LEN {
        return Err(Error::BadCellLength(cell.len()));
    }
    if records.is_empty() || records.len() > FULL_SIZE {
        return Err(Error::Internal("records do not fit in a cell"));
    }
    let start = CELL_LEN - records.len();
    cell[start..].copy_from_slice(records);
    cell[start - 1] = 0;
    rng.fill(&mut cell[..IV_LEN]);
    for b in &mut cell[PREFIX_LEN..start - 1] {
        *b = rng.gen_range(1..=255);
    }
    let ck = checksum(records, &cell[..IV_LEN]);
    cell[IV_LEN..PREFIX_LEN].copy_from_slice(&ck);
    Ok(())
}

/// Check a cell's checksum, and return the part holding its records.
pub fn open(cell: &[u8]) -> Result<&[u8]> {
    if cell.len() != CELL_LEN {
        return Err(Error::BadCellLength(cell.len()));
    }
    let mut r = Reader::from_slice(&cell[PREFIX_LEN..]);
    r.take_until(0).map_err(|_| Error::NoTerminator)?;
    let records = r.into_rest();
    let expected = checksum(records, &cell[..IV_LEN]);
    if !bool::from(expected[..].ct_eq(&cell[IV_LEN..PREFIX_LEN])) {
        return Err(Error::BadChecksum);
    }
    Ok(records)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constants() {
        assert_eq!(FULL_SIZE, 1003);
        assert_eq!(MAX_FRAGMENT_SIZE, 996);
    }

    #[test]
    fn frame_and_open() {
        let mut rng = rand::thread_rng();
        let mut cell = [0_u8; CELL_LEN];
        let records = b"\x00\x00\x05hello";
        frame(&mut cell, &records[..], &mut rng).unwrap();
        assert_eq!(&cell[CELL_LEN - 8..], &records[..]);
        assert_eq!(cell[CELL_LEN - 9], 0);
        assert!(cell[PREFIX_LEN..CELL_LEN - 9].iter().all(|b| *b != 0));
        assert_eq!(open(&cell).unwrap(), &records[..]);

        // Flip a bit in the IV.
        cell[3] ^= 0x20;
        assert_eq!(open(&cell), Err(Error::BadChecksum));
    }

    #[test]
    fn full_cell_has_no_padding() {
        let mut rng = rand::thread_rng();
        let mut cell = [0_u8; CELL_LEN];
        let records = [0x42_u8; FULL_SIZE];
        frame(&mut cell, &records, &mut rng).unwrap();
        assert_eq!(cell[PREFIX_LEN], 0);
        assert_eq!(open(&cell).unwrap().len(), FULL_SIZE);

        let too_many = [0x42_u8; FULL_SIZE + 1];
        assert!(frame(&mut cell, &too_many, &mut rng).is_err());
        assert!(frame(&mut cell, &[], &mut rng).is_err());
        assert_eq!(open(&cell[..5]), Err(Error::BadCellLength(5)));
    }

    #[test]
    fn missing_terminator() {
        let cell = [1_u8; CELL_LEN];
        assert_eq!(open(&cell), Err(Error::NoTerminator));
    }
}
