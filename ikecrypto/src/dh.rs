//! Key exchange group operations behind one enum-dispatched interface
//!
//! Supported groups: MODP-2048 (14), ECP-256 (19), ECP-384 (20) and
//! Curve25519 (31). The remaining groups of the wire enum parse fine but
//! yield [CryptoError::UnsupportedGroup] when used, which the engine turns
//! into proposal rejection.

use ikewire::definitions::params::KeyExchangeMethod;
use num_bigint_dig::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

use crate::{CryptoError, SymKey};

/// The 2048-bit MODP prime of RFC 3526, section 3; the generator is 2
const MODP_2048_PRIME: [u8; 256] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2,
    0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67,
    0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e,
    0x34, 0x04, 0xdd, 0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5,
    0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff,
    0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed, 0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae,
    0x9f, 0x24, 0x11, 0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d,
    0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05, 0x98, 0xda, 0x48, 0x36, 0x1c, 0x55, 0xd3,
    0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f, 0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3,
    0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56, 0x20, 0x85, 0x52, 0xbb, 0x9e, 0xd5, 0x29, 0x07, 0x70,
    0x96, 0x96, 0x6d, 0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04, 0xf1, 0x74, 0x6c, 0x08,
    0xca, 0x18, 0x21, 0x7c, 0x32, 0x90, 0x5e, 0x46, 0x2e, 0x36, 0xce, 0x3b, 0xe3, 0x9e, 0x77,
    0x2c, 0x18, 0x0e, 0x86, 0x03, 0x9b, 0x27, 0x83, 0xa2, 0xec, 0x07, 0xa2, 0x8f, 0xb5, 0xc5,
    0x5d, 0xf0, 0x6f, 0x4c, 0x52, 0xc9, 0xde, 0x2b, 0xcb, 0xf6, 0x95, 0x58, 0x17, 0x18, 0x39,
    0x95, 0x49, 0x7c, 0xea, 0x95, 0x6a, 0xe5, 0x15, 0xd2, 0x26, 0x18, 0x98, 0xfa, 0x05, 0x10,
    0x15, 0x72, 0x8e, 0x5a, 0x8a, 0xac, 0xaa, 0x68, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff,
];

/// Size in octets of the exponent drawn for MODP exchanges
const MODP_EXPONENT_SIZE: usize = 64;

/// An owned, opaque local key exchange secret
///
/// The secret only ever travels between [generate_local] and
/// [compute_shared] of the same group; its representation is group specific
/// and never leaves this module.
#[derive(Clone)]
pub struct KeSecret(Secret);

#[derive(Clone)]
enum Secret {
    Modp(SymKey),
    P256(p256::NonZeroScalar),
    P384(p384::NonZeroScalar),
    X25519(SymKey),
}

impl std::fmt::Debug for KeSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let group = match self.0 {
            Secret::Modp(_) => "modp2048",
            Secret::P256(_) => "ecp256",
            Secret::P384(_) => "ecp384",
            Secret::X25519(_) => "curve25519",
        };
        write!(f, "KeSecret({group})")
    }
}

/// Size in octets of the public value the group puts on the wire
pub fn public_value_size(group: KeyExchangeMethod) -> Result<usize, CryptoError> {
    match group {
        KeyExchangeMethod::Modp2048 => Ok(256),
        KeyExchangeMethod::Ecp256 => Ok(64),
        KeyExchangeMethod::Ecp384 => Ok(96),
        KeyExchangeMethod::Curve25519 => Ok(32),
        other => Err(CryptoError::UnsupportedGroup(other)),
    }
}

/// Draw a fresh local secret and compute the public value to put on the wire
pub fn generate_local(group: KeyExchangeMethod) -> Result<(Vec<u8>, KeSecret), CryptoError> {
    match group {
        KeyExchangeMethod::Modp2048 => {
            let mut exponent = vec![0u8; MODP_EXPONENT_SIZE];
            OsRng.fill_bytes(&mut exponent);
            let prime = BigUint::from_bytes_be(&MODP_2048_PRIME);
            let public = BigUint::from(2u8).modpow(&BigUint::from_bytes_be(&exponent), &prime);
            Ok((
                pad_left(&public.to_bytes_be(), 256),
                KeSecret(Secret::Modp(SymKey::new(exponent))),
            ))
        }
        KeyExchangeMethod::Ecp256 => {
            let secret = p256::NonZeroScalar::random(&mut OsRng);
            let public = p256::PublicKey::from_secret_scalar(&secret);
            let point = p256::EncodedPoint::from(public);
            // RFC 5903: the KE data is x | y without the SEC1 tag octet
            let data = point.as_bytes()[1..].to_vec();
            Ok((data, KeSecret(Secret::P256(secret))))
        }
        KeyExchangeMethod::Ecp384 => {
            let secret = p384::NonZeroScalar::random(&mut OsRng);
            let public = p384::PublicKey::from_secret_scalar(&secret);
            let point = p384::EncodedPoint::from(public);
            let data = point.as_bytes()[1..].to_vec();
            Ok((data, KeSecret(Secret::P384(secret))))
        }
        KeyExchangeMethod::Curve25519 => {
            let secret = X25519Secret::random_from_rng(OsRng);
            let public = X25519Public::from(&secret);
            Ok((
                public.as_bytes().to_vec(),
                KeSecret(Secret::X25519(SymKey::new(secret.to_bytes().to_vec()))),
            ))
        }
        other => Err(CryptoError::UnsupportedGroup(other)),
    }
}

/// Prepend the SEC1 uncompressed tag octet to an x | y wire value
fn sec1_from_wire(peer_public: &[u8]) -> Vec<u8> {
    let mut sec1 = Vec::with_capacity(1 + peer_public.len());
    sec1.push(0x04);
    sec1.extend_from_slice(peer_public);
    sec1
}

/// Combine the local secret with the peer's public value into the shared key
pub fn compute_shared(
    group: KeyExchangeMethod,
    secret: &KeSecret,
    peer_public: &[u8],
) -> Result<SymKey, CryptoError> {
    if peer_public.len() != public_value_size(group)? {
        return Err(CryptoError::BadPeerPublicValue);
    }
    match (&secret.0, group) {
        (Secret::Modp(exponent), KeyExchangeMethod::Modp2048) => {
            let prime = BigUint::from_bytes_be(&MODP_2048_PRIME);
            let peer = BigUint::from_bytes_be(peer_public);
            // reject the degenerate elements 0, 1 and p-1
            if peer <= BigUint::from(1u8) || peer >= &prime - 1u8 {
                return Err(CryptoError::BadPeerPublicValue);
            }
            let exponent = BigUint::from_bytes_be(exponent.as_bytes());
            let shared = peer.modpow(&exponent, &prime);
            Ok(SymKey::new(pad_left(&shared.to_bytes_be(), 256)))
        }
        (Secret::P256(scalar), KeyExchangeMethod::Ecp256) => {
            let public = p256::PublicKey::from_sec1_bytes(&sec1_from_wire(peer_public))
                .map_err(|_| CryptoError::BadPeerPublicValue)?;
            let shared = p256::ecdh::diffie_hellman(scalar, public.as_affine());
            Ok(SymKey::new(shared.raw_secret_bytes().to_vec()))
        }
        (Secret::P384(scalar), KeyExchangeMethod::Ecp384) => {
            let public = p384::PublicKey::from_sec1_bytes(&sec1_from_wire(peer_public))
                .map_err(|_| CryptoError::BadPeerPublicValue)?;
            let shared = p384::ecdh::diffie_hellman(scalar, public.as_affine());
            Ok(SymKey::new(shared.raw_secret_bytes().to_vec()))
        }
        (Secret::X25519(secret), KeyExchangeMethod::Curve25519) => {
            let secret_bytes: [u8; 32] = secret
                .as_bytes()
                .try_into()
                .map_err(|_| CryptoError::BadKeyLength)?;
            let peer_bytes: [u8; 32] = peer_public
                .try_into()
                .map_err(|_| CryptoError::BadPeerPublicValue)?;
            let shared = X25519Secret::from(secret_bytes)
                .diffie_hellman(&X25519Public::from(peer_bytes));
            // an all-zero shared secret marks a low order peer point
            if shared.as_bytes() == &[0u8; 32] {
                return Err(CryptoError::BadPeerPublicValue);
            }
            Ok(SymKey::new(shared.as_bytes().to_vec()))
        }
        (_, other) => Err(CryptoError::UnsupportedGroup(other)),
    }
}

fn pad_left(bytes: &[u8], width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width.saturating_sub(bytes.len())];
    out.extend_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn shared_secret_agrees() {
        for group in [
            KeyExchangeMethod::Modp2048,
            KeyExchangeMethod::Ecp256,
            KeyExchangeMethod::Ecp384,
            KeyExchangeMethod::Curve25519,
        ] {
            let (public_a, secret_a) = generate_local(group).unwrap();
            let (public_b, secret_b) = generate_local(group).unwrap();
            assert_eq!(public_a.len(), public_value_size(group).unwrap());

            let shared_a = compute_shared(group, &secret_a, &public_b).unwrap();
            let shared_b = compute_shared(group, &secret_b, &public_a).unwrap();
            assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn wrong_sized_peer_value_is_refused() {
        let (_, secret) = generate_local(KeyExchangeMethod::Curve25519).unwrap();
        assert!(compute_shared(KeyExchangeMethod::Curve25519, &secret, &[0u8; 16]).is_err());
    }

    #[test]
    fn unimplemented_group_errors() {
        assert!(matches!(
            generate_local(KeyExchangeMethod::Curve448),
            Err(CryptoError::UnsupportedGroup(KeyExchangeMethod::Curve448))
        ));
    }
}
