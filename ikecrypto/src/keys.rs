use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Owned symmetric key material with an explicit lifetime
///
/// The bytes are wiped when the handle is dropped. The Debug impl never
/// prints the material, only its length, so derived Debug on state structs
/// stays safe to log.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymKey(Vec<u8>);

impl SymKey {
    /// Take ownership of raw key material
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key material
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the key in octets
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the handle holds no material at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for SymKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymKey({} octets)", self.0.len())
    }
}
