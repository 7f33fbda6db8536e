//! Plain digests for protocol constructions that hard-code their hash
//!
//! Only the NAT-detection notifies of RFC 7296 still mandate SHA-1; it is a
//! non-cryptographic endpoint fingerprint there, not an authentication
//! primitive.

use sha1::{Digest, Sha1};

/// SHA-1 over the concatenation of the chunks
pub fn sha1(chunks: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_abc_vector() {
        // FIPS 180-1 appendix A
        assert_eq!(
            sha1(&[b"abc"]),
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, //
                0x25, 0x71, 0x78, 0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
            ]
        );
    }

    #[test]
    fn chunking_is_equivalent_to_concatenation() {
        assert_eq!(sha1(&[b"ab", b"c"]), sha1(&[b"abc"]));
    }
}
