//! Node registry owning every [`Device`] record.
//!
//! Lookups never fabricate defaults: callers either get an `Option` or an
//! explicit [`Error::NodeNotFound`].

use crate::device::Device;
use crate::error::{Error, Result};
use crate::types::{is_valid_node_id, NodeId};
use std::collections::BTreeMap;

/// Mapping from node id to device record.
#[derive(Debug, Default, Clone)]
pub struct NodeRegistry {
    /// Devices indexed by node id
    nodes: BTreeMap<NodeId, Device>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a device by node id.
    pub fn get(&self, node_id: NodeId) -> Option<&Device> {
        self.nodes.get(&node_id)
    }

    /// Get a device mutably by node id.
    pub fn get_mut(&mut self, node_id: NodeId) -> Option<&mut Device> {
        self.nodes.get_mut(&node_id)
    }

    /// Get a device or fail with [`Error::NodeNotFound`].
    pub fn get_or_fail(&self, node_id: NodeId) -> Result<&Device> {
        self.nodes
            .get(&node_id)
            .ok_or(Error::NodeNotFound { node_id })
    }

    /// Get a device mutably or fail with [`Error::NodeNotFound`].
    pub fn get_mut_or_fail(&mut self, node_id: NodeId) -> Result<&mut Device> {
        self.nodes
            .get_mut(&node_id)
            .ok_or(Error::NodeNotFound { node_id })
    }

    /// Insert a device, returning the record it replaced.
    pub fn insert(&mut self, device: Device) -> Result<Option<Device>> {
        if !is_valid_node_id(device.id) {
            return Err(Error::InvalidNodeId(device.id));
        }
        Ok(self.nodes.insert(device.id, device))
    }

    /// Remove a device.
    pub fn remove(&mut self, node_id: NodeId) -> Option<Device> {
        self.nodes.remove(&node_id)
    }

    /// Whether a node id is known.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Iterate devices in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.nodes.values()
    }

    /// Known node ids in ascending order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
