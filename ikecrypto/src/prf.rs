//! The negotiated pseudorandom function and its iterated expansion `prf+`
//! (RFC 7296, section 2.13)

use hmac::{Hmac, Mac};
use ikewire::definitions::params::PseudorandomFunction;
use sha2::{Sha256, Sha384, Sha512};

use crate::CryptoError;

macro_rules! hmac_once {
    ($digest:ty, $key:expr, $chunks:expr) => {{
        let mut mac =
            Hmac::<$digest>::new_from_slice($key).map_err(|_| CryptoError::BadKeyLength)?;
        for chunk in $chunks {
            mac.update(chunk);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    }};
}

/// Compute `prf(key, data)` with the negotiated function
pub fn prf(alg: PseudorandomFunction, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    prf_chunks(alg, key, &[data])
}

/// Compute `prf(key, data1 | data2 | ...)` without concatenating first
pub fn prf_chunks(
    alg: PseudorandomFunction,
    key: &[u8],
    chunks: &[&[u8]],
) -> Result<Vec<u8>, CryptoError> {
    match alg {
        PseudorandomFunction::HmacSha2_256 => hmac_once!(Sha256, key, chunks),
        PseudorandomFunction::HmacSha2_384 => hmac_once!(Sha384, key, chunks),
        PseudorandomFunction::HmacSha2_512 => hmac_once!(Sha512, key, chunks),
    }
}

/// Expand `key` and `seed` into `length` octets of keystream
///
/// prf+ (K, S) = T1 | T2 | T3 | ... where T1 = prf(K, S | 0x01) and
/// Tn = prf(K, Tn-1 | S | n). The counter is a single octet, which bounds
/// the total output at 255 blocks.
pub fn prf_plus(
    alg: PseudorandomFunction,
    key: &[u8],
    seed: &[u8],
    length: usize,
) -> Result<Vec<u8>, CryptoError> {
    if length > 255 * alg.output_size() {
        return Err(CryptoError::OutputTooLong);
    }

    let mut out = Vec::with_capacity(length);
    let mut last: Vec<u8> = vec![];
    let mut counter = 1u8;
    while out.len() < length {
        last = prf_chunks(alg, key, &[&last, seed, &[counter]])?;
        out.extend_from_slice(&last);
        counter = counter.wrapping_add(1);
    }
    out.truncate(length);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4231, test case 1
    #[test]
    #[allow(clippy::unwrap_used)]
    fn hmac_sha2_256_vector() {
        let key = [0x0b; 20];
        let mac = prf(PseudorandomFunction::HmacSha2_256, &key, b"Hi There").unwrap();
        assert_eq!(
            mac,
            vec![
                0xb0, 0x34, 0x4c, 0x61, 0xd8, 0xdb, 0x38, 0x53, //
                0x5c, 0xa8, 0xaf, 0xce, 0xaf, 0x0b, 0xf1, 0x2b, //
                0x88, 0x1d, 0xc2, 0x00, 0xc9, 0x83, 0x3d, 0xa7, //
                0x26, 0xe9, 0x37, 0x6c, 0x2e, 0x32, 0xcf, 0xf7,
            ]
        );
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn prf_plus_produces_requested_length() {
        for length in [0usize, 1, 31, 32, 33, 256, 1000] {
            let out = prf_plus(
                PseudorandomFunction::HmacSha2_256,
                b"some key",
                b"some seed",
                length,
            )
            .unwrap();
            assert_eq!(out.len(), length);
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn prf_plus_prefix_stability() {
        // a longer expansion starts with the shorter expansion
        let short = prf_plus(PseudorandomFunction::HmacSha2_512, b"k", b"s", 40).unwrap();
        let long = prf_plus(PseudorandomFunction::HmacSha2_512, b"k", b"s", 200).unwrap();
        assert_eq!(short, long[..40]);
    }

    #[test]
    fn prf_plus_output_bound() {
        assert!(prf_plus(PseudorandomFunction::HmacSha2_256, b"k", b"s", 255 * 32 + 1).is_err());
    }
}
