//! Cryptographic primitives for HomeMesh security bootstrapping.
//!
//! This crate provides the key material the controller hands out while
//! bootstrapping trust with a joining node:
//!
//! - **Network keys**: the legacy shared key and one long-term key per modern
//!   security class, zeroized on drop
//! - **Key store**: the [`KeyStore`] contract the controller consumes and the
//!   in-memory [`SecurityManager`] implementing it
//! - **Key exchange**: X25519 key pairs and temporary-key derivation for the
//!   modern handshake
//! - **DSK handling**: device-specific key fingerprints, PIN entry and the
//!   SmartStart home-id fingerprint
//!
//! # Security Principles
//!
//! - Secrets are never logged; `Debug` output of keys is redacted
//! - Ephemeral secrets are consumed by the Diffie-Hellman step and zeroized
//! - Temporary keys only live until the handshake that created them ends

pub mod dsk;
pub mod ecdh;
pub mod error;
pub mod keys;
pub mod keystore;

pub use dsk::{apply_pin, parse_pin, Dsk, DSK_LENGTH};
pub use ecdh::{derive_temp_keys, EcdhKeyPair, TempKeys, PUBLIC_KEY_LENGTH};
pub use error::{CryptoError, CryptoResult};
pub use keys::{NetworkKey, NETWORK_KEY_LENGTH};
pub use keystore::{KeyStore, SecurityManager};
