//! Per-node device record.
//!
//! A [`Device`] is created as a placeholder when a join is first observed and
//! is filled in as node information and bootstrap results arrive. Records are
//! owned by the [`NodeRegistry`](crate::NodeRegistry).

use crate::types::{CommandClass, DeviceClass, NodeId, NodeStatus, SecurityClass};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Mutable state of one mesh member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Node id in the mesh
    pub id: NodeId,
    /// Device class triple, unknown for replaced nodes until interviewed
    pub device_class: Option<DeviceClass>,
    /// Supported capabilities
    supported: BTreeSet<CommandClass>,
    /// Controlled capabilities
    controlled: BTreeSet<CommandClass>,
    /// Grant table; a missing entry means "not yet determined"
    security_classes: BTreeMap<SecurityClass, bool>,
    /// Device-specific key fingerprint recorded after modern bootstrap
    pub dsk: Option<[u8; 16]>,
    /// Last known liveness
    pub status: NodeStatus,
    /// Always-listening node
    pub is_listening: bool,
    /// Frequently listening (FLiRS) node
    pub is_frequent_listening: bool,
    /// Whether a return route to the SUC has been assigned
    pub has_suc_return_route: bool,
    /// Keep a sleeping node awake after its next wake-up
    pub keep_awake: bool,
    /// Association group -> destination node ids
    associations: BTreeMap<u8, BTreeSet<NodeId>>,
}

impl Device {
    /// Create an empty placeholder for a node whose join was just observed.
    pub fn placeholder(id: NodeId) -> Self {
        Self {
            id,
            device_class: None,
            supported: BTreeSet::new(),
            controlled: BTreeSet::new(),
            security_classes: BTreeMap::new(),
            dsk: None,
            status: NodeStatus::Unknown,
            is_listening: true,
            is_frequent_listening: false,
            has_suc_return_route: false,
            keep_awake: false,
            associations: BTreeMap::new(),
        }
    }

    /// Create a record from the information announced during a join.
    pub fn from_node_info(
        id: NodeId,
        device_class: DeviceClass,
        supported: impl IntoIterator<Item = CommandClass>,
        controlled: impl IntoIterator<Item = CommandClass>,
    ) -> Self {
        let mut device = Self::placeholder(id);
        device.device_class = Some(device_class);
        device.supported.extend(supported);
        device.controlled.extend(controlled);
        device
    }

    /// Whether the node advertises a capability.
    pub fn supports(&self, cc: CommandClass) -> bool {
        self.supported.contains(&cc)
    }

    /// Whether the node controls a capability.
    pub fn controls(&self, cc: CommandClass) -> bool {
        self.controlled.contains(&cc)
    }

    /// Mark a capability as supported.
    pub fn add_supported(&mut self, cc: CommandClass) {
        self.supported.insert(cc);
    }

    /// Forget a supported capability.
    pub fn remove_supported(&mut self, cc: CommandClass) {
        self.supported.remove(&cc);
    }

    /// Supported capabilities.
    pub fn supported(&self) -> impl Iterator<Item = CommandClass> + '_ {
        self.supported.iter().copied()
    }

    /// Tri-state grant lookup: `None` while undetermined.
    pub fn security_class(&self, class: SecurityClass) -> Option<bool> {
        self.security_classes.get(&class).copied()
    }

    /// Record whether a class is granted.
    pub fn set_security_class(&mut self, class: SecurityClass, granted: bool) {
        self.security_classes.insert(class, granted);
    }

    /// Whether a class is known to be granted.
    pub fn has_security_class(&self, class: SecurityClass) -> bool {
        self.security_class(class) == Some(true)
    }

    /// Record exactly `granted` as granted and every other grantable class as not.
    pub fn set_granted_exactly(&mut self, granted: &[SecurityClass]) {
        for class in SecurityClass::GRANTABLE {
            self.set_security_class(class, granted.contains(&class));
        }
    }

    /// Explicitly un-grant every grantable class.
    pub fn revoke_all_security_classes(&mut self) {
        self.set_granted_exactly(&[]);
    }

    /// Strongest class known to be granted.
    pub fn highest_security_class(&self) -> Option<SecurityClass> {
        SecurityClass::GRANTABLE
            .into_iter()
            .find(|class| self.has_security_class(*class))
            .or_else(|| {
                // every class determined and none granted means plaintext
                SecurityClass::GRANTABLE
                    .iter()
                    .all(|class| self.security_class(*class) == Some(false))
                    .then_some(SecurityClass::None)
            })
    }

    /// Battery powered node that is not always listening.
    pub fn can_sleep(&self) -> bool {
        !self.is_listening && !self.is_frequent_listening
    }

    /// Replace the destinations of one association group.
    pub fn set_association_group(&mut self, group: u8, destinations: impl IntoIterator<Item = NodeId>) {
        self.associations
            .insert(group, destinations.into_iter().collect());
    }

    /// Destinations of one association group.
    pub fn association_group(&self, group: u8) -> Option<&BTreeSet<NodeId>> {
        self.associations.get(&group)
    }

    /// Union of all association destinations across every group.
    pub fn association_destinations(&self) -> BTreeSet<NodeId> {
        self.associations.values().flatten().copied().collect()
    }
}
