//! X25519 key exchange for the modern bootstrap handshake.
//!
//! The including controller and the joining node each generate an ephemeral
//! X25519 key pair and exchange public keys. The joining node withholds the
//! first two bytes of its public key; they are entered out of band as a PIN
//! and patched in before the shared secret is computed.
//!
//! # Key Derivation
//!
//! 1. **Extract**: BLAKE3 `derive_key` over `secret || including_pub || joining_pub`
//! 2. **Expand**: two further `derive_key` calls yield the temporary
//!    symmetric key and the personalization value
//! 3. **Zeroize**: the intermediate material is erased
//!
//! Both sides must pass the public keys in the same order (including node
//! first) to arrive at the same temporary keys.

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{NetworkKey, NETWORK_KEY_LENGTH};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an X25519 public key.
pub const PUBLIC_KEY_LENGTH: usize = 32;

const PRK_CONTEXT: &str = "homemesh 2024-05 s2 bootstrap prk";
const TEMP_KEY_CONTEXT: &str = "homemesh 2024-05 s2 temporary key";
const PERSONALIZATION_CONTEXT: &str = "homemesh 2024-05 s2 personalization string";

/// Ephemeral key pair for one handshake.
///
/// The secret is consumed by [`compute_shared_secret`](Self::compute_shared_secret)
/// and zeroized by `EphemeralSecret`'s own drop.
pub struct EcdhKeyPair {
    pub public: X25519PublicKey,
    secret: Option<EphemeralSecret>,
}

impl EcdhKeyPair {
    /// Generate a new ephemeral key pair from the OS entropy source.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let secret = EphemeralSecret::random_from_rng(&mut rng);
        let public = X25519PublicKey::from(&secret);

        Self {
            public,
            secret: Some(secret),
        }
    }

    /// Raw public key bytes.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// Compute the shared secret with the peer's (complete) public key.
    pub fn compute_shared_secret(
        &mut self,
        peer_public: &[u8; PUBLIC_KEY_LENGTH],
    ) -> CryptoResult<[u8; 32]> {
        let secret = self
            .secret
            .take()
            .ok_or_else(|| CryptoError::KeyExchange("secret key already consumed".to_string()))?;
        let shared = secret.diffie_hellman(&X25519PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchange(
                "peer public key is a low-order point".to_string(),
            ));
        }
        Ok(*shared.as_bytes())
    }
}

/// Temporary key material installed for a peer while its handshake runs.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TempKeys {
    /// Symmetric key protecting the remaining handshake messages
    pub key: [u8; NETWORK_KEY_LENGTH],
    /// Personalization value seeding the nonce generator
    pub personalization: [u8; 32],
}

impl std::fmt::Debug for TempKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TempKeys(<redacted>)")
    }
}

impl TempKeys {
    /// The temporary key as a network key.
    pub fn as_network_key(&self) -> NetworkKey {
        NetworkKey::from_bytes(self.key)
    }
}

/// Derive the temporary keys from the shared secret and both public keys.
pub fn derive_temp_keys(
    shared_secret: &[u8; 32],
    including_public: &[u8; PUBLIC_KEY_LENGTH],
    joining_public: &[u8; PUBLIC_KEY_LENGTH],
) -> TempKeys {
    let mut material = Vec::with_capacity(32 + 2 * PUBLIC_KEY_LENGTH);
    material.extend_from_slice(shared_secret);
    material.extend_from_slice(including_public);
    material.extend_from_slice(joining_public);

    let mut prk = blake3::derive_key(PRK_CONTEXT, &material);
    material.zeroize();

    let mut expanded = blake3::derive_key(TEMP_KEY_CONTEXT, &prk);
    let mut key = [0u8; NETWORK_KEY_LENGTH];
    key.copy_from_slice(&expanded[..NETWORK_KEY_LENGTH]);
    expanded.zeroize();

    let personalization = blake3::derive_key(PERSONALIZATION_CONTEXT, &prk);
    prk.zeroize();

    TempKeys {
        key,
        personalization,
    }
}
