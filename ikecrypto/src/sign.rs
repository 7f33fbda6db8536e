//! Asymmetric signing and verification for the AUTH payload
//!
//! The classic RSA method and the Digital Signature method (RFC 7427) share
//! the same primitives; the latter additionally wraps the signature in a
//! length-prefixed ASN.1 AlgorithmIdentifier, which [encode_digsig] and
//! [split_digsig] handle. SHA-1 is never offered or accepted (RFC 8247).

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use ikewire::definitions::params::SignatureHashAlgorithm;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::CryptoError;

/// DER AlgorithmIdentifier of sha256WithRSAEncryption (1.2.840.113549.1.1.11)
pub const ALGID_RSA_SHA2_256: &[u8] = &[
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b, 0x05, 0x00,
];
/// DER AlgorithmIdentifier of sha384WithRSAEncryption (1.2.840.113549.1.1.12)
pub const ALGID_RSA_SHA2_384: &[u8] = &[
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0c, 0x05, 0x00,
];
/// DER AlgorithmIdentifier of sha512WithRSAEncryption (1.2.840.113549.1.1.13)
pub const ALGID_RSA_SHA2_512: &[u8] = &[
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0d, 0x05, 0x00,
];
/// DER AlgorithmIdentifier of Ed25519 (1.3.101.112, RFC 8420)
pub const ALGID_ED25519: &[u8] = &[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70];

/// A private key usable for AUTH payload signatures
#[derive(Clone)]
pub enum PrivateKey {
    /// RSA, used by both the classic RSA method and DIGSIG
    Rsa(Box<RsaPrivateKey>),
    /// Ed25519, DIGSIG only
    Ed25519(Box<SigningKey>),
}

/// A public key extracted from the peer's verified credentials
#[derive(Clone)]
pub enum PublicKey {
    /// RSA public half
    Rsa(Box<RsaPublicKey>),
    /// Ed25519 public half
    Ed25519(Box<VerifyingKey>),
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivateKey::Rsa(_) => write!(f, "PrivateKey(rsa)"),
            PrivateKey::Ed25519(_) => write!(f, "PrivateKey(ed25519)"),
        }
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublicKey::Rsa(_) => write!(f, "PublicKey(rsa)"),
            PublicKey::Ed25519(_) => write!(f, "PublicKey(ed25519)"),
        }
    }
}

impl PrivateKey {
    /// Decode an RSA private key from PKCS#1 DER
    pub fn rsa_from_der(der: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self::Rsa(Box::new(
            RsaPrivateKey::from_pkcs1_der(der).map_err(|_| CryptoError::BadKey)?,
        )))
    }

    /// Build an Ed25519 private key from its 32 octet seed
    pub fn ed25519_from_seed(seed: [u8; 32]) -> Self {
        Self::Ed25519(Box::new(SigningKey::from_bytes(&seed)))
    }

    /// The matching public key
    pub fn public(&self) -> PublicKey {
        match self {
            PrivateKey::Rsa(key) => PublicKey::Rsa(Box::new(key.to_public_key())),
            PrivateKey::Ed25519(key) => PublicKey::Ed25519(Box::new(key.verifying_key())),
        }
    }
}

impl PublicKey {
    /// Decode an RSA public key from PKCS#1 DER
    pub fn rsa_from_der(der: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self::Rsa(Box::new(
            RsaPublicKey::from_pkcs1_der(der).map_err(|_| CryptoError::BadKey)?,
        )))
    }

    /// Build an Ed25519 public key from its 32 octet encoding
    pub fn ed25519_from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::BadKey)?;
        Ok(Self::Ed25519(Box::new(
            VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::BadKey)?,
        )))
    }
}

fn digest(hash: SignatureHashAlgorithm, octets: &[u8]) -> Result<Vec<u8>, CryptoError> {
    match hash {
        SignatureHashAlgorithm::Sha2_256 => Ok(Sha256::digest(octets).to_vec()),
        SignatureHashAlgorithm::Sha2_384 => Ok(Sha384::digest(octets).to_vec()),
        SignatureHashAlgorithm::Sha2_512 => Ok(Sha512::digest(octets).to_vec()),
        // Identity feeds the full octets to the signature scheme (Ed25519)
        SignatureHashAlgorithm::Identity => Ok(octets.to_vec()),
        SignatureHashAlgorithm::Sha1 => Err(CryptoError::SignatureInvalid),
    }
}

fn rsa_padding(hash: SignatureHashAlgorithm) -> Result<Pkcs1v15Sign, CryptoError> {
    match hash {
        SignatureHashAlgorithm::Sha2_256 => Ok(Pkcs1v15Sign::new::<Sha256>()),
        SignatureHashAlgorithm::Sha2_384 => Ok(Pkcs1v15Sign::new::<Sha384>()),
        SignatureHashAlgorithm::Sha2_512 => Ok(Pkcs1v15Sign::new::<Sha512>()),
        _ => Err(CryptoError::SignatureInvalid),
    }
}

/// Sign the (already prf-hashed) AUTH octets
pub fn sign(
    key: &PrivateKey,
    hash: SignatureHashAlgorithm,
    octets: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match key {
        PrivateKey::Rsa(key) => key
            .sign(rsa_padding(hash)?, &digest(hash, octets)?)
            .map_err(|_| CryptoError::SignatureInvalid),
        PrivateKey::Ed25519(key) => Ok(key.sign(octets).to_bytes().to_vec()),
    }
}

/// Verify a signature over the AUTH octets
pub fn verify(
    key: &PublicKey,
    hash: SignatureHashAlgorithm,
    octets: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    match key {
        PublicKey::Rsa(key) => key
            .verify(rsa_padding(hash)?, &digest(hash, octets)?, signature)
            .map_err(|_| CryptoError::SignatureInvalid),
        PublicKey::Ed25519(key) => {
            let signature = ed25519_dalek::Signature::from_slice(signature)
                .map_err(|_| CryptoError::SignatureInvalid)?;
            key.verify(octets, &signature)
                .map_err(|_| CryptoError::SignatureInvalid)
        }
    }
}

/// The DIGSIG AlgorithmIdentifier matching a key and hash choice
pub fn digsig_algorithm(
    key: &PrivateKey,
    hash: SignatureHashAlgorithm,
) -> Result<&'static [u8], CryptoError> {
    match (key, hash) {
        (PrivateKey::Rsa(_), SignatureHashAlgorithm::Sha2_256) => Ok(ALGID_RSA_SHA2_256),
        (PrivateKey::Rsa(_), SignatureHashAlgorithm::Sha2_384) => Ok(ALGID_RSA_SHA2_384),
        (PrivateKey::Rsa(_), SignatureHashAlgorithm::Sha2_512) => Ok(ALGID_RSA_SHA2_512),
        (PrivateKey::Ed25519(_), SignatureHashAlgorithm::Identity) => Ok(ALGID_ED25519),
        _ => Err(CryptoError::SignatureInvalid),
    }
}

/// Wrap a signature into the RFC 7427 AUTH data format:
/// one length octet, the DER AlgorithmIdentifier, then the signature value
pub fn encode_digsig(algorithm: &[u8], signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + algorithm.len() + signature.len());
    out.push(algorithm.len() as u8);
    out.extend_from_slice(algorithm);
    out.extend_from_slice(signature);
    out
}

/// Split RFC 7427 AUTH data into AlgorithmIdentifier and signature value
pub fn split_digsig(data: &[u8]) -> Result<(&[u8], &[u8]), CryptoError> {
    let [len, rest @ ..] = data else {
        return Err(CryptoError::SignatureInvalid);
    };
    let len = *len as usize;
    if rest.len() <= len {
        return Err(CryptoError::SignatureInvalid);
    }
    Ok((&rest[..len], &rest[len..]))
}

/// Map an AlgorithmIdentifier back to the hash the verifier must use
pub fn hash_for_algorithm(algorithm: &[u8]) -> Result<SignatureHashAlgorithm, CryptoError> {
    match algorithm {
        _ if algorithm == ALGID_RSA_SHA2_256 => Ok(SignatureHashAlgorithm::Sha2_256),
        _ if algorithm == ALGID_RSA_SHA2_384 => Ok(SignatureHashAlgorithm::Sha2_384),
        _ if algorithm == ALGID_RSA_SHA2_512 => Ok(SignatureHashAlgorithm::Sha2_512),
        _ if algorithm == ALGID_ED25519 => Ok(SignatureHashAlgorithm::Identity),
        _ => Err(CryptoError::SignatureInvalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn ed25519_sign_verify_roundtrip() {
        let key = PrivateKey::ed25519_from_seed([0x17; 32]);
        let octets = b"prf-hashed auth octets";
        let signature = sign(&key, SignatureHashAlgorithm::Identity, octets).unwrap();
        verify(
            &key.public(),
            SignatureHashAlgorithm::Identity,
            octets,
            &signature,
        )
        .unwrap();
        assert!(verify(
            &key.public(),
            SignatureHashAlgorithm::Identity,
            b"different octets",
            &signature,
        )
        .is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn digsig_blob_roundtrip() {
        let blob = encode_digsig(ALGID_ED25519, &[0xab; 64]);
        let (algorithm, signature) = split_digsig(&blob).unwrap();
        assert_eq!(algorithm, ALGID_ED25519);
        assert_eq!(signature, &[0xab; 64]);
        assert_eq!(
            hash_for_algorithm(algorithm).unwrap(),
            SignatureHashAlgorithm::Identity
        );
    }

    #[test]
    fn sha1_is_rejected_for_signing() {
        let key = PrivateKey::ed25519_from_seed([0x17; 32]);
        assert!(matches!(
            digsig_algorithm(&key, SignatureHashAlgorithm::Sha1),
            Err(CryptoError::SignatureInvalid)
        ));
    }
}
