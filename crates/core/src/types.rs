//! Core types shared across the controller stack.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric identifier of a mesh member.
pub type NodeId = u16;

/// Highest node id that can be assigned to a mesh member.
pub const MAX_NODE_ID: NodeId = 232;

/// Reserved id addressing every node at once.
pub const BROADCAST_NODE_ID: NodeId = 255;

/// Returns true if `node_id` may be assigned to a single device.
pub fn is_valid_node_id(node_id: NodeId) -> bool {
    (1..=MAX_NODE_ID).contains(&node_id)
}

/// Named trust tier a node may be granted.
///
/// The declaration order is the security ranking: a later variant is a
/// stronger class than an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SecurityClass {
    /// Plaintext communication
    None,
    /// Key established during the modern handshake, valid only until it completes
    Temporary,
    /// Legacy single shared network key
    S0Legacy,
    /// Modern class without out-of-band authentication
    S2Unauthenticated,
    /// Modern class authenticated by DSK/PIN
    S2Authenticated,
    /// Modern class for access control devices (locks, garage doors)
    S2AccessControl,
}

impl SecurityClass {
    /// Classes a controller can grant, strongest first.
    pub const GRANTABLE: [SecurityClass; 4] = [
        SecurityClass::S2AccessControl,
        SecurityClass::S2Authenticated,
        SecurityClass::S2Unauthenticated,
        SecurityClass::S0Legacy,
    ];

    /// Modern (ECDH bootstrapped) classes, strongest first.
    pub const S2: [SecurityClass; 3] = [
        SecurityClass::S2AccessControl,
        SecurityClass::S2Authenticated,
        SecurityClass::S2Unauthenticated,
    ];

    /// Whether this is one of the modern classes.
    pub fn is_s2(self) -> bool {
        Self::S2.contains(&self)
    }

    /// Whether granting this class requires the DSK to be confirmed out of band.
    pub fn requires_authentication(self) -> bool {
        matches!(
            self,
            SecurityClass::S2Authenticated | SecurityClass::S2AccessControl
        )
    }
}

impl fmt::Display for SecurityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecurityClass::None => "None",
            SecurityClass::Temporary => "Temporary",
            SecurityClass::S0Legacy => "S0_Legacy",
            SecurityClass::S2Unauthenticated => "S2_Unauthenticated",
            SecurityClass::S2Authenticated => "S2_Authenticated",
            SecurityClass::S2AccessControl => "S2_AccessControl",
        };
        f.write_str(name)
    }
}

/// Capability identifiers the controller core needs to reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CommandClass {
    /// No Operation, used as a liveness probe
    NoOperation,
    /// Legacy single-key security
    Security,
    /// Modern per-class security
    Security2,
    /// Single-destination association groups
    Association,
    /// Multi-destination association groups
    MultiChannelAssociation,
    /// Wake-up interval and destination for sleeping nodes
    WakeUp,
    /// Anything the core does not interpret
    Other(u8),
}

impl CommandClass {
    /// Map a raw command-class identifier.
    pub fn from_id(id: u8) -> Self {
        match id {
            0x00 => CommandClass::NoOperation,
            0x98 => CommandClass::Security,
            0x9F => CommandClass::Security2,
            0x85 => CommandClass::Association,
            0x8E => CommandClass::MultiChannelAssociation,
            0x84 => CommandClass::WakeUp,
            other => CommandClass::Other(other),
        }
    }

    /// Raw command-class identifier.
    pub fn id(self) -> u8 {
        match self {
            CommandClass::NoOperation => 0x00,
            CommandClass::Security => 0x98,
            CommandClass::Security2 => 0x9F,
            CommandClass::Association => 0x85,
            CommandClass::MultiChannelAssociation => 0x8E,
            CommandClass::WakeUp => 0x84,
            CommandClass::Other(id) => id,
        }
    }
}

/// Generic device class for entry control (locks, barrier operators).
const GENERIC_ENTRY_CONTROL: u8 = 0x40;
/// Generic device class for security panels.
const GENERIC_SECURITY_PANEL: u8 = 0x17;

/// Device-class triple announced in the node information frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceClass {
    /// Basic device class
    pub basic: u8,
    /// Generic device class
    pub generic: u8,
    /// Specific device class
    pub specific: u8,
}

impl DeviceClass {
    /// Create a device class triple.
    pub fn new(basic: u8, generic: u8, specific: u8) -> Self {
        Self {
            basic,
            generic,
            specific,
        }
    }

    /// Whether devices of this class must be included securely.
    pub fn requires_security(&self) -> bool {
        match self.generic {
            // every entry control specific class except "not used"
            GENERIC_ENTRY_CONTROL => self.specific != 0x00,
            GENERIC_SECURITY_PANEL => true,
            _ => false,
        }
    }
}

/// Last known liveness of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Not yet determined
    #[default]
    Unknown,
    /// Sleeping node currently not reachable
    Asleep,
    /// Sleeping node that is currently awake
    Awake,
    /// Listening node that answered recently
    Alive,
    /// Node failed to answer and is considered unreachable
    Dead,
}

/// What happens to a node's provisioning entry after it is excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionStrategy {
    /// Leave the provisioning list untouched
    ExcludeOnly,
    /// Keep the entry but mark it inactive so SmartStart ignores the device
    #[default]
    DisableProvisioningEntry,
    /// Delete the entry
    Unprovision,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_class_ranking() {
        assert!(SecurityClass::S2AccessControl > SecurityClass::S2Authenticated);
        assert!(SecurityClass::S2Unauthenticated > SecurityClass::S0Legacy);
        assert!(SecurityClass::S0Legacy > SecurityClass::None);
        assert_eq!(SecurityClass::GRANTABLE[0], SecurityClass::S2AccessControl);
    }

    #[test]
    fn test_requires_authentication() {
        assert!(SecurityClass::S2AccessControl.requires_authentication());
        assert!(SecurityClass::S2Authenticated.requires_authentication());
        assert!(!SecurityClass::S2Unauthenticated.requires_authentication());
        assert!(!SecurityClass::S0Legacy.requires_authentication());
    }

    #[test]
    fn test_command_class_ids_round_trip() {
        for id in [0x00u8, 0x98, 0x9F, 0x85, 0x8E, 0x84, 0x25] {
            assert_eq!(CommandClass::from_id(id).id(), id);
        }
        assert_eq!(CommandClass::from_id(0x25), CommandClass::Other(0x25));
    }

    #[test]
    fn test_device_class_security_mandate() {
        let door_lock = DeviceClass::new(0x04, 0x40, 0x03);
        let switch = DeviceClass::new(0x04, 0x10, 0x01);
        let panel = DeviceClass::new(0x04, 0x17, 0x01);

        assert!(door_lock.requires_security());
        assert!(panel.requires_security());
        assert!(!switch.requires_security());
    }

    #[test]
    fn test_node_id_range() {
        assert!(is_valid_node_id(1));
        assert!(is_valid_node_id(MAX_NODE_ID));
        assert!(!is_valid_node_id(0));
        assert!(!is_valid_node_id(BROADCAST_NODE_ID));
    }
}
