//! Layers on tunnel-build reply records.
//!
//! When a tunnel is built, each hop writes a reply record and then
//! every hop after it encrypts the whole reply once more on the way
//! back to the creator.  The creator undoes those layers to read each
//! hop's answer.  Older hops use AES-256-CBC for their own record and
//! for the layers; newer hops seal their own record with
//! ChaCha20-Poly1305 instead, but still add AES layers for the others.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::KeyInit as _;
use aes::Aes256;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit as _, Nonce, Tag};
use sha2::{Digest, Sha256};

use super::layer::{cbc_decrypt, cbc_encrypt};
use super::HopLayer;
use crate::util::ct::bytes_eq;
use crate::{Error, Result};

/// Length of a build reply record.
pub const REPLY_RECORD_LEN: usize = 528;
/// Length of the Poly1305 tag at the end of an AEAD reply record.
pub const TAG_LEN: usize = 16;
/// Length of the hash at the front of an AES reply record.
const HASH_LEN: usize = 32;

/// The AES-256-CBC reply layer of one hop.
#[derive(Clone)]
pub struct AesReplyLayer {
    /// The reply key.
    key: Aes256,
    /// The reply IV.
    iv: [u8; 16],
}

impl AesReplyLayer {
    /// Construct a reply layer from a key and IV.
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        AesReplyLayer {
            key: Aes256::new(GenericArray::from_slice(&key[..])),
            iv: *iv,
        }
    }
    /// Add this layer to a record, as the hop itself does.
    pub fn add_one_hop(&self, record: &mut [u8]) -> Result<()> {
        check_blocks(record)?;
        cbc_encrypt(&self.key, &self.iv, record);
        Ok(())
    }
}

impl HopLayer for AesReplyLayer {
    fn peel_one_hop(&self, record: &mut [u8]) -> Result<()> {
        check_blocks(record)?;
        cbc_decrypt(&self.key, &self.iv, record);
        Ok(())
    }
}

/// Make sure a record is a whole number of AES blocks.
fn check_blocks(record: &[u8]) -> Result<()> {
    if record.is_empty() || record.len() % 16 != 0 {
        return Err(Error::Internal("reply record is not a whole number of blocks"));
    }
    Ok(())
}

/// The ChaCha20-Poly1305 reply layer of one hop.
///
/// Unlike the AES layers this one authenticates: peeling it fails if
/// the record was tampered with or sealed under another key.
pub struct AeadReplyLayer {
    /// The cipher, keyed with the hop's reply key.
    cipher: ChaCha20Poly1305,
    /// Associated data bound to the record.
    ad: [u8; 32],
    /// Nonce counter.
    nonce: u64,
}

impl AeadReplyLayer {
    /// Construct a reply layer from a key and associated data, using
    /// nonce 0.
    pub fn new(key: &[u8; 32], ad: &[u8; 32]) -> Self {
        AeadReplyLayer {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key[..])),
            ad: *ad,
            nonce: 0,
        }
    }
    /// Return the 96-bit nonce: four zero bytes then a little-endian
    /// counter.
    fn nonce(&self) -> Nonce {
        let mut n = [0_u8; 12];
        n[4..].copy_from_slice(&self.nonce.to_le_bytes());
        *Nonce::from_slice(&n[..])
    }
    /// Seal a record in place.  The last [`TAG_LEN`] bytes of `record`
    /// are overwritten with the tag.
    pub fn seal(&self, record: &mut [u8]) -> Result<()> {
        if record.len() < TAG_LEN {
            return Err(Error::Internal("reply record shorter than a tag"));
        }
        let split = record.len() - TAG_LEN;
        let (body, tag_out) = record.split_at_mut(split);
        let tag = self
            .cipher
            .encrypt_in_place_detached(&self.nonce(), &self.ad, body)
            .map_err(|_| Error::Internal("AEAD seal failed"))?;
        tag_out.copy_from_slice(&tag);
        Ok(())
    }
}

impl HopLayer for AeadReplyLayer {
    fn peel_one_hop(&self, record: &mut [u8]) -> Result<()> {
        if record.len() < TAG_LEN {
            return Err(Error::BadAuth);
        }
        let split = record.len() - TAG_LEN;
        let (body, tag) = record.split_at_mut(split);
        let tag = *Tag::from_slice(tag);
        self.cipher
            .decrypt_in_place_detached(&self.nonce(), &self.ad, body, &tag)
            .map_err(|_| Error::BadAuth)
    }
}

/// Check the hash on a fully-unwrapped AES reply record, and return its
/// status byte.
pub fn verify_aes_record(record: &[u8]) -> Result<u8> {
    if record.len() <= HASH_LEN {
        return Err(Error::BadAuth);
    }
    let h = Sha256::digest(&record[HASH_LEN..]);
    if !bytes_eq(&h[..], &record[..HASH_LEN]) {
        return Err(Error::BadAuth);
    }
    Ok(record[record.len() - 1])
}

/// Return the status byte of a fully-unwrapped, already-authenticated
/// AEAD reply record: the last byte before the tag.
pub fn aead_record_status(record: &[u8]) -> Result<u8> {
    if record.len() <= TAG_LEN {
        return Err(Error::BadAuth);
    }
    Ok(record[record.len() - TAG_LEN - 1])
}

/// Build an AES reply record carrying `status`, as a hop would: the
/// hash of the rest, `filler`, and the status byte at the end.
pub fn make_aes_record(filler: &[u8], status: u8) -> [u8; REPLY_RECORD_LEN] {
    let mut rec = [0_u8; REPLY_RECORD_LEN];
    let body = &mut rec[HASH_LEN..REPLY_RECORD_LEN - 1];
    let n = filler.len().min(body.len());
    body[..n].copy_from_slice(&filler[..n]);
    rec[REPLY_RECORD_LEN - 1] = status;
    let h = Sha256::digest(&rec[HASH_LEN..]);
    rec[..HASH_LEN].copy_from_slice(&h);
    rec
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aes_record_verifies() {
        let rec = make_aes_record(b"filler", 0);
        assert_eq!(verify_aes_record(&rec), Ok(0));
        let mut bad = rec;
        bad[200] ^= 1;
        assert_eq!(verify_aes_record(&bad), Err(Error::BadAuth));

        let layer = AesReplyLayer::new(&[5; 32], &[6; 16]);
        let mut wrapped = make_aes_record(b"", 30);
        layer.add_one_hop(&mut wrapped).unwrap();
        assert!(verify_aes_record(&wrapped).is_err());
        layer.peel_one_hop(&mut wrapped).unwrap();
        assert_eq!(verify_aes_record(&wrapped), Ok(30));
    }

    #[test]
    fn aead_record() {
        let layer = AeadReplyLayer::new(&[1; 32], &[2; 32]);
        let mut rec = [0_u8; REPLY_RECORD_LEN];
        rec[REPLY_RECORD_LEN - TAG_LEN - 1] = 7;
        layer.seal(&mut rec).unwrap();
        let mut copy = rec;
        layer.peel_one_hop(&mut copy).unwrap();
        assert_eq!(aead_record_status(&copy), Ok(7));

        // Wrong associated data.
        let other = AeadReplyLayer::new(&[1; 32], &[3; 32]);
        let mut copy = rec;
        assert_eq!(other.peel_one_hop(&mut copy), Err(Error::BadAuth));

        // Tampered.
        let mut copy = rec;
        copy[9] ^= 0x40;
        assert_eq!(layer.peel_one_hop(&mut copy), Err(Error::BadAuth));
    }

    #[test]
    fn odd_lengths() {
        let layer = AesReplyLayer::new(&[5; 32], &[6; 16]);
        let mut odd = [0_u8; 218];
        assert!(layer.peel_one_hop(&mut odd).is_err());
        let aead = AeadReplyLayer::new(&[1; 32], &[2; 32]);
        assert_eq!(aead.peel_one_hop(&mut odd[..3]), Err(Error::BadAuth));
    }
}
