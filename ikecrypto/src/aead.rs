//! AEAD seal/open for the SK payload (RFC 5282) and the ESP key sizes
//!
//! The keymat of an AEAD transform is the cipher key followed by a 4 octet
//! salt. The nonce fed to the cipher is salt | IV where the 8 octet IV
//! travels in the clear at the front of the SK payload data.

use aes_gcm::aead::{Aead, KeyInit, Payload as AeadPayload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use ikewire::definitions::params::EncryptionAlgorithm;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::{CryptoError, SymKey};

/// Size in octets of the salt at the tail of AEAD keymat
pub const SALT_SIZE: usize = 4;
/// Size in octets of the explicit IV at the front of the SK data
pub const IV_SIZE: usize = 8;
/// Size in octets of the ICV of the supported AEAD ciphers
pub const TAG_SIZE: usize = 16;

/// A ready-to-use AEAD key: algorithm, cipher key and salt
#[derive(Debug, Clone)]
pub struct AeadKey {
    alg: EncryptionAlgorithm,
    keymat: SymKey,
}

impl AeadKey {
    /// Wrap keymat (cipher key | salt) for the given algorithm
    pub fn new(alg: EncryptionAlgorithm, keymat: SymKey) -> Result<Self, CryptoError> {
        match alg {
            EncryptionAlgorithm::AesGcm16 => {
                if keymat.len() != 16 + SALT_SIZE && keymat.len() != 32 + SALT_SIZE {
                    return Err(CryptoError::BadKeyLength);
                }
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => {
                if keymat.len() != 32 + SALT_SIZE {
                    return Err(CryptoError::BadKeyLength);
                }
            }
            other => return Err(CryptoError::UnsupportedCipher(other)),
        }
        Ok(Self { alg, keymat })
    }

    /// Size in octets of keymat required for the algorithm and key length
    pub fn keymat_size(
        alg: EncryptionAlgorithm,
        key_length: Option<u16>,
    ) -> Result<usize, CryptoError> {
        match alg {
            EncryptionAlgorithm::AesGcm16 => match key_length {
                Some(128) => Ok(16 + SALT_SIZE),
                Some(256) => Ok(32 + SALT_SIZE),
                _ => Err(CryptoError::BadKeyLength),
            },
            EncryptionAlgorithm::ChaCha20Poly1305 => Ok(32 + SALT_SIZE),
            other => Err(CryptoError::UnsupportedCipher(other)),
        }
    }

    fn split(&self) -> (&[u8], &[u8]) {
        let bytes = self.keymat.as_bytes();
        bytes.split_at(bytes.len() - SALT_SIZE)
    }

    fn nonce(&self, iv: &[u8; IV_SIZE]) -> [u8; SALT_SIZE + IV_SIZE] {
        let (_, salt) = self.split();
        let mut nonce = [0u8; SALT_SIZE + IV_SIZE];
        nonce[..SALT_SIZE].copy_from_slice(salt);
        nonce[SALT_SIZE..].copy_from_slice(iv);
        nonce
    }

    /// Encrypt and authenticate, yielding IV | ciphertext | ICV
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        self.seal_with_iv(&iv, aad, plaintext)
    }

    /// Deterministic variant of [AeadKey::seal] for tests and reply caching
    pub fn seal_with_iv(
        &self,
        iv: &[u8; IV_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let (key, _) = self.split();
        let nonce = self.nonce(iv);
        let payload = AeadPayload {
            msg: plaintext,
            aad,
        };
        let sealed = match (self.alg, key.len()) {
            (EncryptionAlgorithm::AesGcm16, 16) => Aes128Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::BadKeyLength)?
                .encrypt((&nonce).into(), payload),
            (EncryptionAlgorithm::AesGcm16, _) => Aes256Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::BadKeyLength)?
                .encrypt((&nonce).into(), payload),
            (EncryptionAlgorithm::ChaCha20Poly1305, _) => {
                ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| CryptoError::BadKeyLength)?
                    .encrypt((&nonce).into(), payload)
            }
            (other, _) => return Err(CryptoError::UnsupportedCipher(other)),
        }
        .map_err(|_| CryptoError::IntegrityCheckFailed)?;

        let mut out = Vec::with_capacity(IV_SIZE + sealed.len());
        out.extend_from_slice(iv);
        out.extend(sealed);
        Ok(out)
    }

    /// Verify and decrypt IV | ciphertext | ICV, yielding the plaintext
    pub fn open(&self, aad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < IV_SIZE + TAG_SIZE {
            return Err(CryptoError::IntegrityCheckFailed);
        }
        let iv: [u8; IV_SIZE] = data[..IV_SIZE]
            .try_into()
            .map_err(|_| CryptoError::IntegrityCheckFailed)?;
        let (key, _) = self.split();
        let nonce = self.nonce(&iv);
        let payload = AeadPayload {
            msg: &data[IV_SIZE..],
            aad,
        };
        match (self.alg, key.len()) {
            (EncryptionAlgorithm::AesGcm16, 16) => Aes128Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::BadKeyLength)?
                .decrypt((&nonce).into(), payload),
            (EncryptionAlgorithm::AesGcm16, _) => Aes256Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::BadKeyLength)?
                .decrypt((&nonce).into(), payload),
            (EncryptionAlgorithm::ChaCha20Poly1305, _) => {
                ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| CryptoError::BadKeyLength)?
                    .decrypt((&nonce).into(), payload)
            }
            (other, _) => return Err(CryptoError::UnsupportedCipher(other)),
        }
        .map_err(|_| CryptoError::IntegrityCheckFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn seal_open_roundtrip() {
        for (alg, keymat_len) in [
            (EncryptionAlgorithm::AesGcm16, 20),
            (EncryptionAlgorithm::AesGcm16, 36),
            (EncryptionAlgorithm::ChaCha20Poly1305, 36),
        ] {
            let key = AeadKey::new(alg, SymKey::new(vec![0x42; keymat_len])).unwrap();
            let sealed = key.seal(b"header", b"secret payload").unwrap();
            assert_eq!(sealed.len(), IV_SIZE + b"secret payload".len() + TAG_SIZE);
            let opened = key.open(b"header", &sealed).unwrap();
            assert_eq!(opened, b"secret payload");
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn tampered_aad_is_refused() {
        let key =
            AeadKey::new(EncryptionAlgorithm::AesGcm16, SymKey::new(vec![0x42; 36])).unwrap();
        let sealed = key.seal(b"header", b"secret payload").unwrap();
        assert!(matches!(
            key.open(b"other header", &sealed),
            Err(CryptoError::IntegrityCheckFailed)
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn tampered_ciphertext_is_refused() {
        let key =
            AeadKey::new(EncryptionAlgorithm::AesGcm16, SymKey::new(vec![0x42; 36])).unwrap();
        let mut sealed = key.seal(b"header", b"secret payload").unwrap();
        sealed[IV_SIZE] ^= 0x01;
        assert!(key.open(b"header", &sealed).is_err());
    }

    #[test]
    fn wrong_keymat_length_is_refused() {
        assert!(AeadKey::new(EncryptionAlgorithm::AesGcm16, SymKey::new(vec![0x42; 33])).is_err());
    }
}
