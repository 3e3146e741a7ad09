//! The per-hop transform on tunnel cells.
//!
//! A cell is an IV followed by 1008 bytes of payload.  To peel a
//! layer, a hop:
//!
//!  1. decrypts the IV with its IV key (AES-256, one block);
//!  2. decrypts the payload with its layer key in CBC mode, using that
//!     IV;
//!  3. decrypts the IV a second time, so that the IV the next hop sees
//!     is unrelated to the CBC chaining value.
//!
//! Adding a layer is the same three steps, inverted.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, InnerIvInit, KeyInit};
use aes::Aes256;
use tunnel_cell::cell::{CELL_LEN, IV_LEN};

use super::HopLayer;
use crate::{Error, Result};

/// AES block length.
const BLOCK: usize = 16;

/// AES-256 in CBC mode, encrypting.
type CbcEnc = cbc::Encryptor<Aes256>;
/// AES-256 in CBC mode, decrypting.
type CbcDec = cbc::Decryptor<Aes256>;

/// Encrypt `buf` in place in CBC mode.  `buf` must be a whole number of
/// blocks.
pub(crate) fn cbc_encrypt(key: &Aes256, iv: &[u8; BLOCK], buf: &mut [u8]) {
    let mut enc = CbcEnc::inner_iv_init(key.clone(), GenericArray::from_slice(iv));
    for block in buf.chunks_exact_mut(BLOCK) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Decrypt `buf` in place in CBC mode.  `buf` must be a whole number of
/// blocks.
pub(crate) fn cbc_decrypt(key: &Aes256, iv: &[u8; BLOCK], buf: &mut [u8]) {
    let mut dec = CbcDec::inner_iv_init(key.clone(), GenericArray::from_slice(iv));
    for block in buf.chunks_exact_mut(BLOCK) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// A hop's pair of tunnel keys.
///
/// The key schedules are wiped when this is dropped.
#[derive(Clone)]
pub struct TunnelLayer {
    /// Key for the cell payload.
    layer_key: Aes256,
    /// Key for the IV.
    iv_key: Aes256,
}

impl TunnelLayer {
    /// Construct a layer from a 32-byte layer key and 32-byte IV key.
    pub fn new(layer_key: &[u8; 32], iv_key: &[u8; 32]) -> Self {
        TunnelLayer {
            layer_key: Aes256::new(GenericArray::from_slice(&layer_key[..])),
            iv_key: Aes256::new(GenericArray::from_slice(&iv_key[..])),
        }
    }

    /// Split a cell into its IV and payload, checking its length.
    fn split(cell: &mut [u8]) -> Result<(&mut [u8], &mut [u8])> {
        if cell.len() != CELL_LEN {
            return Err(tunnel_cell::Error::BadCellLength(cell.len()).into());
        }
        Ok(cell.split_at_mut(IV_LEN))
    }

    /// Add this hop's layer to `cell`: the exact inverse of
    /// [`HopLayer::peel_one_hop`].
    ///
    /// The creator of a tunnel uses this to pre-encrypt outbound cells
    /// and to unwrap inbound ones.
    pub fn add_one_hop(&self, cell: &mut [u8]) -> Result<()> {
        let (iv, payload) = Self::split(cell)?;
        self.iv_key.encrypt_block(GenericArray::from_mut_slice(iv));
        let chain = block_of(iv)?;
        cbc_encrypt(&self.layer_key, &chain, payload);
        self.iv_key.encrypt_block(GenericArray::from_mut_slice(iv));
        Ok(())
    }
}

impl HopLayer for TunnelLayer {
    fn peel_one_hop(&self, cell: &mut [u8]) -> Result<()> {
        let (iv, payload) = Self::split(cell)?;
        self.iv_key.decrypt_block(GenericArray::from_mut_slice(iv));
        let chain = block_of(iv)?;
        cbc_decrypt(&self.layer_key, &chain, payload);
        self.iv_key.decrypt_block(GenericArray::from_mut_slice(iv));
        Ok(())
    }
}

/// Copy a 16-byte slice into an array.
pub(crate) fn block_of(b: &[u8]) -> Result<[u8; BLOCK]> {
    if b.len() != BLOCK {
        return Err(Error::Internal("IV is not one block"));
    }
    let mut out = [0_u8; BLOCK];
    out.copy_from_slice(b);
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::RngCore;

    fn layer(seed: u8) -> TunnelLayer {
        TunnelLayer::new(&[seed; 32], &[seed.wrapping_add(1); 32])
    }

    #[test]
    fn cbc_known_answer() {
        // NIST SP 800-38A, F.2.5 (CBC-AES256.Encrypt), first two blocks.
        let key = hex_literal::hex!(
            "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4"
        );
        let iv = hex_literal::hex!("000102030405060708090a0b0c0d0e0f");
        let mut buf = hex_literal::hex!(
            "6bc1bee22e409f96e93d7e117393172a"
            "ae2d8a571e03ac9c9eb76fac45af8e51"
        );
        let aes = Aes256::new(GenericArray::from_slice(&key[..]));
        cbc_encrypt(&aes, &iv, &mut buf);
        assert_eq!(
            buf,
            hex_literal::hex!(
                "f58c4c04d6e5f1ba779eabfb5f7bfbd6"
                "9cfc4e967edb808d679f777bc6702c7d"
            )
        );
        cbc_decrypt(&aes, &iv, &mut buf);
        assert_eq!(
            buf,
            hex_literal::hex!(
                "6bc1bee22e409f96e93d7e117393172a"
                "ae2d8a571e03ac9c9eb76fac45af8e51"
            )
        );
    }

    #[test]
    fn peel_inverts_add() {
        let mut rng = rand::thread_rng();
        let mut cell = [0_u8; CELL_LEN];
        rng.fill_bytes(&mut cell);
        let orig = cell;
        let l = layer(3);
        l.add_one_hop(&mut cell).unwrap();
        assert_ne!(&cell[..], &orig[..]);
        l.peel_one_hop(&mut cell).unwrap();
        assert_eq!(&cell[..], &orig[..]);
    }

    #[test]
    fn layers_nest() {
        let mut rng = rand::thread_rng();
        let mut cell = [0_u8; CELL_LEN];
        rng.fill_bytes(&mut cell);
        let orig = cell;
        let hops: Vec<_> = (1..=3).map(|i| layer(i * 10)).collect();
        // The creator adds the innermost layer first...
        for h in hops.iter().rev() {
            h.add_one_hop(&mut cell).unwrap();
        }
        // ...and each hop peels its own, in order.
        for h in hops.iter() {
            h.peel_one_hop(&mut cell).unwrap();
        }
        assert_eq!(&cell[..], &orig[..]);
    }

    #[test]
    fn wrong_length() {
        let mut short = [0_u8; 100];
        assert!(layer(1).peel_one_hop(&mut short).is_err());
    }
}
