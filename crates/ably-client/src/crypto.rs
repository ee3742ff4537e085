//! Symmetric payload encryption for channel messages (AES-CBC, PKCS7).
//!
//! Ciphertext layout on the wire is `iv || cbc(plaintext)`; the IV is freshly
//! random per message unless pinned for tests.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::Error;

const IV_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Cipher configuration for an encrypted channel.
#[derive(Clone)]
pub struct CipherParams {
    key: Vec<u8>,
    /// Fixed IV for deterministic output. Tests only; leave `None` in
    /// production so every message gets a fresh IV.
    iv: Option<[u8; IV_LEN]>,
}

impl CipherParams {
    /// AES-CBC with a 128- or 256-bit key.
    pub fn aes_cbc(key: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let key = key.into();
        if key.len() != 16 && key.len() != 32 {
            return Err(Error::Crypto(format!(
                "AES key must be 16 or 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(CipherParams { key, iv: None })
    }

    /// Generate a random key of the given bit length (128 or 256).
    pub fn generate_random_key(bits: usize) -> Result<Vec<u8>, Error> {
        if bits != 128 && bits != 256 {
            return Err(Error::Crypto(format!("invalid AES key length: {bits}")));
        }
        let mut key = vec![0u8; bits / 8];
        rand::thread_rng().fill_bytes(&mut key);
        Ok(key)
    }

    #[cfg(test)]
    pub(crate) fn with_iv(mut self, iv: [u8; IV_LEN]) -> Self {
        self.iv = Some(iv);
        self
    }

    pub fn key_length(&self) -> usize {
        self.key.len() * 8
    }

    /// The encoding-chain token for this cipher, e.g. `cipher+aes-128-cbc`.
    pub fn encoding_token(&self) -> String {
        format!("cipher+aes-{}-cbc", self.key_length())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let iv = match self.iv {
            Some(iv) => iv,
            None => {
                let mut iv = [0u8; IV_LEN];
                rand::thread_rng().fill_bytes(&mut iv);
                iv
            }
        };
        let mut out = Vec::with_capacity(IV_LEN + plaintext.len() + IV_LEN);
        out.extend_from_slice(&iv);
        let ct = match self.key.len() {
            16 => Aes128CbcEnc::new_from_slices(&self.key, &iv)
                .map_err(|e| Error::Crypto(format!("cipher init: {e}")))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            32 => Aes256CbcEnc::new_from_slices(&self.key, &iv)
                .map_err(|e| Error::Crypto(format!("cipher init: {e}")))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            _ => unreachable!("key length validated in constructor"),
        };
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        if ciphertext.len() < IV_LEN {
            return Err(Error::Crypto("ciphertext shorter than IV".into()));
        }
        let (iv, ct) = ciphertext.split_at(IV_LEN);
        match self.key.len() {
            16 => Aes128CbcDec::new_from_slices(&self.key, iv)
                .map_err(|e| Error::Crypto(format!("cipher init: {e}")))?
                .decrypt_padded_vec_mut::<Pkcs7>(ct)
                .map_err(|e| Error::Crypto(format!("decrypt: {e}"))),
            32 => Aes256CbcDec::new_from_slices(&self.key, iv)
                .map_err(|e| Error::Crypto(format!("cipher init: {e}")))?
                .decrypt_padded_vec_mut::<Pkcs7>(ct)
                .map_err(|e| Error::Crypto(format!("decrypt: {e}"))),
            _ => unreachable!("key length validated in constructor"),
        }
    }
}

impl std::fmt::Debug for CipherParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the key.
        f.debug_struct("CipherParams")
            .field("key_length", &self.key_length())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_128() {
        let cipher = CipherParams::aes_cbc(vec![7u8; 16]).unwrap();
        let ct = cipher.encrypt(b"hello world").unwrap();
        assert_ne!(&ct[IV_LEN..], b"hello world");
        assert_eq!(cipher.decrypt(&ct).unwrap(), b"hello world");
    }

    #[test]
    fn round_trip_256() {
        let cipher = CipherParams::aes_cbc(vec![9u8; 32]).unwrap();
        let ct = cipher.encrypt(b"").unwrap();
        assert_eq!(cipher.decrypt(&ct).unwrap(), b"");
    }

    #[test]
    fn fresh_iv_per_message() {
        let cipher = CipherParams::aes_cbc(vec![1u8; 16]).unwrap();
        let a = cipher.encrypt(b"same input").unwrap();
        let b = cipher.encrypt(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn pinned_iv_is_deterministic() {
        let cipher = CipherParams::aes_cbc(vec![1u8; 16]).unwrap().with_iv([3u8; 16]);
        let a = cipher.encrypt(b"same input").unwrap();
        let b = cipher.encrypt(b"same input").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(CipherParams::aes_cbc(vec![0u8; 15]).is_err());
        assert!(CipherParams::generate_random_key(192).is_err());
        assert_eq!(CipherParams::generate_random_key(256).unwrap().len(), 32);
    }

    #[test]
    fn encoding_token() {
        let cipher = CipherParams::aes_cbc(vec![0u8; 16]).unwrap();
        assert_eq!(cipher.encoding_token(), "cipher+aes-128-cbc");
        let cipher = CipherParams::aes_cbc(vec![0u8; 32]).unwrap();
        assert_eq!(cipher.encoding_token(), "cipher+aes-256-cbc");
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        let cipher = CipherParams::aes_cbc(vec![0u8; 16]).unwrap();
        assert!(cipher.decrypt(&[0u8; 8]).is_err());
    }
}
