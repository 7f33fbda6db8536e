//! Randomness with the protocol's rules attached

use rand::rngs::OsRng;
use rand::RngCore;

/// Size in octets of the nonces this implementation contributes; at least
/// half of the largest negotiable prf key and within the [16, 256] window of
/// RFC 7296
pub const NONCE_SIZE: usize = 32;

/// Draw a fresh nonce of [NONCE_SIZE] octets
pub fn random_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Draw a random non-zero 8 octet SPI for an IKE SA
pub fn random_ike_spi() -> u64 {
    loop {
        let spi = OsRng.next_u64();
        if spi != 0 {
            return spi;
        }
    }
}

/// Draw a random non-zero 4 octet SPI for a Child SA
pub fn random_child_spi() -> u32 {
    loop {
        let spi = OsRng.next_u32();
        if spi != 0 {
            return spi;
        }
    }
}

/// Fill a buffer with random bytes, for cookie secrets and fragment IDs
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_respects_protocol_window() {
        let nonce = random_nonce();
        assert!(nonce.len() >= 16 && nonce.len() <= 256);
    }

    #[test]
    fn spis_are_nonzero() {
        for _ in 0..64 {
            assert_ne!(random_ike_spi(), 0);
            assert_ne!(random_child_spi(), 0);
        }
    }
}
