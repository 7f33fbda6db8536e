//! # ikecrypto
//!
//! Crypto services for the IKEv2 negotiation engine
//!
//! Everything in here is a pure function over owned inputs: the engine hands
//! byte buffers in, gets byte buffers (or [SymKey] handles) back and never
//! shares mutable state with a worker thread. The split into modules follows
//! the service boundaries of the protocol: [prf] for the key schedule, [dh]
//! for key exchange groups, [aead] for the SK payload cipher, [sign] for
//! asymmetric authentication and [nonce] for randomness with protocol rules
//! attached.

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

pub mod aead;
pub mod dh;
pub mod hash;
pub mod nonce;
pub mod prf;
pub mod sign;

mod keys;

pub use keys::SymKey;

use ikewire::definitions::params::{EncryptionAlgorithm, KeyExchangeMethod};
use thiserror::Error;

/// Failure inside one of the crypto services
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum CryptoError {
    #[error("Key exchange group {0:?} is parseable but not implemented")]
    UnsupportedGroup(KeyExchangeMethod),
    #[error("Cipher {0:?} is parseable but not implemented")]
    UnsupportedCipher(EncryptionAlgorithm),
    #[error("Key material has the wrong length for the selected algorithm")]
    BadKeyLength,
    #[error("Peer's public value doesn't decode as a group element")]
    BadPeerPublicValue,
    #[error("Integrity check on an encrypted payload failed")]
    IntegrityCheckFailed,
    #[error("Asymmetric key doesn't decode")]
    BadKey,
    #[error("Signature verification failed")]
    SignatureInvalid,
    #[error("Requested keystream exceeds the prf+ output bound")]
    OutputTooLong,
}
