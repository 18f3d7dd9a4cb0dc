//! Network key material

use crate::error::{CryptoError, CryptoResult};
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of every network key in bytes.
pub const NETWORK_KEY_LENGTH: usize = 16;

/// Long-term symmetric key for one security class.
///
/// The key bytes are zeroized when dropped and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct NetworkKey([u8; NETWORK_KEY_LENGTH]);

impl NetworkKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; NETWORK_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse a key from a hex string.
    pub fn from_hex(text: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("not valid hex: {}", e)))?;
        let bytes: [u8; NETWORK_KEY_LENGTH] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                NETWORK_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; NETWORK_KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; NETWORK_KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(<redacted>)")
    }
}
