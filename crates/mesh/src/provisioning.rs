//! SmartStart provisioning list.
//!
//! Entries are keyed by DSK string. A SmartStart join request is matched to an
//! entry through the NWI home id derived from the entry's DSK.

use homemesh_core::{NodeId, SecurityClass};
use homemesh_crypto::{CryptoResult, Dsk};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Whether SmartStart should act on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProvisioningStatus {
    #[default]
    Active,
    Inactive,
}

/// One allow-listed SmartStart device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningEntry {
    /// DSK in its textual form
    pub dsk: String,
    /// Classes to grant automatically
    pub security_classes: Vec<SecurityClass>,
    /// Classes the device asked for when it was scanned, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_security_classes: Option<Vec<SecurityClass>>,
    #[serde(default)]
    pub status: ProvisioningStatus,
    /// Node id once the device is included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

impl ProvisioningEntry {
    /// Active entry granting `security_classes`.
    pub fn new(dsk: impl Into<String>, security_classes: Vec<SecurityClass>) -> Self {
        Self {
            dsk: dsk.into(),
            security_classes,
            requested_security_classes: None,
            status: ProvisioningStatus::Active,
            node_id: None,
        }
    }

    /// Parsed DSK.
    pub fn parsed_dsk(&self) -> CryptoResult<Dsk> {
        self.dsk.parse()
    }

    pub fn is_active(&self) -> bool {
        self.status == ProvisioningStatus::Active
    }

    /// Active and not yet included.
    pub fn is_pending(&self) -> bool {
        self.is_active() && self.node_id.is_none()
    }

    /// NWI home id the device announces, if the DSK parses.
    pub fn nwi_home_id(&self) -> Option<[u8; 4]> {
        self.parsed_dsk().ok().map(|dsk| dsk.nwi_home_id())
    }
}

/// Lookup key for [`ProvisioningList::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningKey {
    Dsk(String),
    NodeId(NodeId),
}

impl From<NodeId> for ProvisioningKey {
    fn from(node_id: NodeId) -> Self {
        ProvisioningKey::NodeId(node_id)
    }
}

impl From<&str> for ProvisioningKey {
    fn from(dsk: &str) -> Self {
        ProvisioningKey::Dsk(dsk.to_string())
    }
}

impl From<String> for ProvisioningKey {
    fn from(dsk: String) -> Self {
        ProvisioningKey::Dsk(dsk)
    }
}

/// The SmartStart allow-list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisioningList {
    entries: Vec<ProvisioningEntry>,
}

impl ProvisioningList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry or replace the one with the same DSK.
    pub fn upsert(&mut self, entry: ProvisioningEntry) -> CryptoResult<()> {
        let dsk = entry.parsed_dsk()?;
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.parsed_dsk().ok() == Some(dsk))
        {
            Some(existing) => *existing = entry,
            None => {
                debug!(dsk = %dsk, "Provisioning entry added");
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    /// Remove an entry. Returns the removed entry.
    pub fn remove(&mut self, key: &ProvisioningKey) -> Option<ProvisioningEntry> {
        let index = self.position(key)?;
        Some(self.entries.remove(index))
    }

    pub fn get(&self, key: &ProvisioningKey) -> Option<&ProvisioningEntry> {
        self.position(key).map(|index| &self.entries[index])
    }

    pub fn get_mut(&mut self, key: &ProvisioningKey) -> Option<&mut ProvisioningEntry> {
        self.position(key).map(move |index| &mut self.entries[index])
    }

    /// Active entry whose DSK yields this NWI home id.
    pub fn find_active_by_nwi_home_id(&self, nwi_home_id: [u8; 4]) -> Option<&ProvisioningEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.is_active())
            .find(|entry| entry.nwi_home_id() == Some(nwi_home_id))
    }

    /// Whether any entry is waiting for its device to join.
    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(ProvisioningEntry::is_pending)
    }

    pub fn entries(&self) -> &[ProvisioningEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the list to pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a list from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Write the list to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json)
    }

    /// Read a list from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }

    fn position(&self, key: &ProvisioningKey) -> Option<usize> {
        match key {
            ProvisioningKey::Dsk(text) => {
                let dsk = text.parse::<Dsk>().ok()?;
                self.entries
                    .iter()
                    .position(|entry| entry.parsed_dsk().ok() == Some(dsk))
            }
            ProvisioningKey::NodeId(node_id) => self
                .entries
                .iter()
                .position(|entry| entry.node_id == Some(*node_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DSK_A: &str = "34028-23669-20938-46346-33746-07431-56821-14553";
    const DSK_B: &str = "11111-22222-33333-44444-55555-00001-00002-00003";

    #[test]
    fn test_upsert_replaces_by_dsk() {
        let mut list = ProvisioningList::new();
        list.upsert(ProvisioningEntry::new(DSK_A, vec![SecurityClass::S2Unauthenticated]))
            .unwrap();
        list.upsert(ProvisioningEntry::new(DSK_A, vec![SecurityClass::S2Authenticated]))
            .unwrap();

        assert_eq!(list.len(), 1);
        assert_eq!(
            list.entries()[0].security_classes,
            vec![SecurityClass::S2Authenticated]
        );
    }

    #[test]
    fn test_upsert_rejects_malformed_dsk() {
        let mut list = ProvisioningList::new();
        assert!(list.upsert(ProvisioningEntry::new("12345", vec![])).is_err());
        assert!(list.is_empty());
    }

    #[test]
    fn test_lookup_by_node_id_and_dsk() {
        let mut list = ProvisioningList::new();
        let mut entry = ProvisioningEntry::new(DSK_B, vec![SecurityClass::S2AccessControl]);
        entry.node_id = Some(12);
        list.upsert(entry).unwrap();

        assert!(list.get(&ProvisioningKey::from(12)).is_some());
        assert!(list.get(&ProvisioningKey::from(DSK_B)).is_some());
        assert!(list.get(&ProvisioningKey::from(13)).is_none());
        assert!(list.remove(&ProvisioningKey::from(12)).is_some());
        assert!(list.is_empty());
    }

    #[test]
    fn test_nwi_lookup_ignores_inactive() {
        let mut list = ProvisioningList::new();
        let entry = ProvisioningEntry::new(DSK_A, vec![SecurityClass::S2Unauthenticated]);
        let nwi = entry.nwi_home_id().unwrap();
        list.upsert(entry).unwrap();
        assert!(list.find_active_by_nwi_home_id(nwi).is_some());
        assert!(list.has_pending());

        list.get_mut(&ProvisioningKey::from(DSK_A)).unwrap().status =
            ProvisioningStatus::Inactive;
        assert!(list.find_active_by_nwi_home_id(nwi).is_none());
        assert!(!list.has_pending());
    }

    #[test]
    fn test_json_round_trip() {
        let mut list = ProvisioningList::new();
        list.upsert(ProvisioningEntry::new(DSK_A, vec![SecurityClass::S0Legacy]))
            .unwrap();
        let json = list.to_json().unwrap();
        assert!(json.contains(DSK_A));
        assert_eq!(ProvisioningList::from_json(&json).unwrap(), list);
    }
}
