//! Device-specific key (DSK) handling.
//!
//! A DSK is the first 16 bytes of a joining node's public key. Its textual
//! form is eight dash-separated 5-digit decimal blocks, each block a
//! big-endian `u16`. The first block doubles as the PIN a user enters to
//! authenticate the node.

use crate::ecdh::PUBLIC_KEY_LENGTH;
use crate::error::{CryptoError, CryptoResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a DSK in bytes.
pub const DSK_LENGTH: usize = 16;

const BLOCKS: usize = DSK_LENGTH / 2;

/// Device-specific key fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dsk([u8; DSK_LENGTH]);

impl Dsk {
    /// Wrap raw DSK bytes.
    pub fn from_bytes(bytes: [u8; DSK_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Take the DSK from a node's public key.
    pub fn from_public_key(public_key: &[u8; PUBLIC_KEY_LENGTH]) -> Self {
        let mut bytes = [0u8; DSK_LENGTH];
        bytes.copy_from_slice(&public_key[..DSK_LENGTH]);
        Self(bytes)
    }

    /// Raw DSK bytes.
    pub fn as_bytes(&self) -> &[u8; DSK_LENGTH] {
        &self.0
    }

    /// The PIN formed by the first two bytes.
    pub fn pin(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    /// Textual form with the PIN block left out, as shown to a user who must
    /// enter the PIN (`-xxxxx-...`).
    pub fn masked(&self) -> String {
        let full = self.to_string();
        full[5..].to_string()
    }

    /// Home-id fingerprint a SmartStart node announces before it joins.
    pub fn nwi_home_id(&self) -> [u8; 4] {
        let mut id = [self.0[8], self.0[9], self.0[10], self.0[11]];
        id[0] |= 0xC0;
        id[3] &= 0xFE;
        id
    }
}

impl fmt::Display for Dsk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, block) in self.0.chunks_exact(2).enumerate() {
            if index > 0 {
                f.write_str("-")?;
            }
            write!(f, "{:05}", u16::from_be_bytes([block[0], block[1]]))?;
        }
        Ok(())
    }
}

impl FromStr for Dsk {
    type Err = CryptoError;

    fn from_str(text: &str) -> CryptoResult<Self> {
        let blocks: Vec<&str> = text.trim().split('-').collect();
        if blocks.len() != BLOCKS {
            return Err(CryptoError::InvalidDsk(format!(
                "expected {} blocks, got {}",
                BLOCKS,
                blocks.len()
            )));
        }

        let mut bytes = [0u8; DSK_LENGTH];
        for (index, block) in blocks.iter().enumerate() {
            let value = parse_block(block)
                .ok_or_else(|| CryptoError::InvalidDsk(format!("invalid block {:?}", block)))?;
            bytes[index * 2..index * 2 + 2].copy_from_slice(&value.to_be_bytes());
        }
        Ok(Self(bytes))
    }
}

fn parse_block(block: &str) -> Option<u16> {
    if block.len() != 5 || !block.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    block.parse::<u16>().ok()
}

/// Parse a user-entered PIN: exactly five decimal digits, at most 65535.
pub fn parse_pin(text: &str) -> CryptoResult<u16> {
    parse_block(text.trim()).ok_or_else(|| CryptoError::InvalidPin(text.to_string()))
}

/// Patch the withheld first two bytes of a public key with the PIN.
pub fn apply_pin(public_key: &mut [u8; PUBLIC_KEY_LENGTH], pin: u16) {
    public_key[..2].copy_from_slice(&pin.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "34028-23669-20938-46346-33746-07431-56821-14553";

    #[test]
    fn test_parse_and_format() {
        let dsk: Dsk = SAMPLE.parse().unwrap();
        assert_eq!(dsk.to_string(), SAMPLE);
        assert_eq!(dsk.pin(), 34028);
        assert_eq!(dsk.masked(), "-23669-20938-46346-33746-07431-56821-14553");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("1234-23669".parse::<Dsk>().is_err());
        assert!("99999-23669-20938-46346-33746-07431-56821-14553"
            .parse::<Dsk>()
            .is_err());
        assert!("3402a-23669-20938-46346-33746-07431-56821-14553"
            .parse::<Dsk>()
            .is_err());
    }

    #[test]
    fn test_parse_pin() {
        assert_eq!(parse_pin("01234").unwrap(), 1234);
        assert_eq!(parse_pin("65535").unwrap(), 65535);
        assert!(parse_pin("1234").is_err());
        assert!(parse_pin("65536").is_err());
        assert!(parse_pin("12a45").is_err());
    }

    #[test]
    fn test_nwi_home_id_flags() {
        let dsk = Dsk::from_bytes([0xFF; DSK_LENGTH]);
        assert_eq!(dsk.nwi_home_id(), [0xFF, 0xFF, 0xFF, 0xFE]);

        let dsk = Dsk::from_bytes([0x00; DSK_LENGTH]);
        assert_eq!(dsk.nwi_home_id(), [0xC0, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_apply_pin() {
        let mut key = [0u8; PUBLIC_KEY_LENGTH];
        apply_pin(&mut key, 34028);
        assert_eq!(Dsk::from_public_key(&key).pin(), 34028);
    }
}
