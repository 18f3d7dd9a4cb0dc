//! Key store consumed by the bootstrap handshakes.
//!
//! The [`KeyStore`] trait is the contract between the controller and whatever
//! holds the network keys. The transport layer reports which key each inbound
//! message was decrypted with through [`KeyStore::record_inbound`], which is
//! what lets the handshakes verify that a message arrived under the expected
//! key.

use crate::ecdh::TempKeys;
use crate::error::CryptoResult;
use crate::keys::NetworkKey;
use homemesh_core::{NodeId, SecurityClass, SecuritySection};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Access to network keys and per-peer temporary key state.
pub trait KeyStore: Send + Sync {
    /// Legacy shared network key, if configured.
    fn legacy_key(&self) -> Option<NetworkKey>;

    /// Long-term key of a modern class (or the legacy key for `S0Legacy`).
    fn class_key(&self, class: SecurityClass) -> Option<NetworkKey>;

    /// Install temporary keys for a peer during its handshake.
    fn set_temporary_key(&self, peer: NodeId, keys: TempKeys);

    /// Temporary keys currently installed for a peer.
    fn temporary_key(&self, peer: NodeId) -> Option<TempKeys>;

    /// Drop temporary keys and any recorded traffic state for a peer.
    fn clear_temporary_key(&self, peer: NodeId);

    /// Record the class the latest inbound message from `peer` was decrypted with.
    fn record_inbound(&self, peer: NodeId, class: SecurityClass);

    /// Whether the latest inbound message from `peer` was decrypted with `class`.
    fn has_traffic_used_class(&self, peer: NodeId, class: SecurityClass) -> bool;
}

#[derive(Default)]
struct KeyState {
    class_keys: HashMap<SecurityClass, NetworkKey>,
    temp_keys: HashMap<NodeId, TempKeys>,
    last_inbound: HashMap<NodeId, SecurityClass>,
}

/// In-memory key store.
#[derive(Default)]
pub struct SecurityManager {
    state: RwLock<KeyState>,
}

impl SecurityManager {
    /// Create a key store without any keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a key store from the `[security]` configuration section.
    pub fn from_config(config: &SecuritySection) -> CryptoResult<Self> {
        let manager = Self::new();
        for class in SecurityClass::GRANTABLE {
            if let Some(text) = config.key_hex(class) {
                manager.set_class_key(class, NetworkKey::from_hex(text)?);
            }
        }
        Ok(manager)
    }

    /// Builder-style key installation.
    pub fn with_key(self, class: SecurityClass, key: NetworkKey) -> Self {
        self.set_class_key(class, key);
        self
    }

    /// Install or replace the long-term key of a class.
    pub fn set_class_key(&self, class: SecurityClass, key: NetworkKey) {
        debug!(class = %class, "Network key installed");
        self.write().class_keys.insert(class, key);
    }

    /// Classes that have a long-term key.
    pub fn configured_classes(&self) -> Vec<SecurityClass> {
        let state = self.read();
        SecurityClass::GRANTABLE
            .into_iter()
            .filter(|class| state.class_keys.contains_key(class))
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, KeyState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, KeyState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyStore for SecurityManager {
    fn legacy_key(&self) -> Option<NetworkKey> {
        self.class_key(SecurityClass::S0Legacy)
    }

    fn class_key(&self, class: SecurityClass) -> Option<NetworkKey> {
        self.read().class_keys.get(&class).cloned()
    }

    fn set_temporary_key(&self, peer: NodeId, keys: TempKeys) {
        debug!(node_id = peer, "Temporary key installed");
        self.write().temp_keys.insert(peer, keys);
    }

    fn temporary_key(&self, peer: NodeId) -> Option<TempKeys> {
        self.read().temp_keys.get(&peer).cloned()
    }

    fn clear_temporary_key(&self, peer: NodeId) {
        let mut state = self.write();
        if state.temp_keys.remove(&peer).is_some() {
            debug!(node_id = peer, "Temporary key removed");
        }
        state.last_inbound.remove(&peer);
    }

    fn record_inbound(&self, peer: NodeId, class: SecurityClass) {
        self.write().last_inbound.insert(peer, class);
    }

    fn has_traffic_used_class(&self, peer: NodeId, class: SecurityClass) -> bool {
        self.read().last_inbound.get(&peer) == Some(&class)
    }
}
