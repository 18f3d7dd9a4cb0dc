//! Device commands the controller core exchanges with mesh members.
//!
//! These are decoded values; framing and encryption belong to the transport.
//! [`Encapsulation`] tells the transport which key protects an outbound
//! command.

use homemesh_core::{Device, NodeId, SecurityClass};
use homemesh_crypto::{NetworkKey, PUBLIC_KEY_LENGTH};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key exchange schemes of the modern handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KexScheme {
    /// The only scheme defined so far
    Kex1,
}

/// Elliptic curve profiles of the modern handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcdhProfile {
    Curve25519,
}

/// Reason carried by a key-exchange abort notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KexFailType {
    /// None of the requested keys can be granted
    NoKeyMatch,
    /// No common key exchange scheme
    NoSupportedScheme,
    /// No common curve
    NoSupportedCurve,
    /// A message could not be decrypted
    Decrypt,
    /// The handshake was canceled locally
    BootstrappingCanceled,
    /// The echoed parameters do not match
    WrongSecurityLevel,
    /// A key was requested that was not granted
    KeyNotGranted,
    /// A key verification arrived under the wrong key
    NoVerify,
    /// The key report differs from the one expected
    DifferentKey,
}

/// Parameters exchanged by key-exchange report and set messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexParameters {
    /// Set on the echo copy that confirms the other side's message
    pub echo: bool,
    /// The node asks for client-side authentication
    pub request_csa: bool,
    pub schemes: Vec<KexScheme>,
    pub curves: Vec<EcdhProfile>,
    /// Requested (report) or granted (set) security classes
    pub keys: Vec<SecurityClass>,
}

impl KexParameters {
    /// Parameters using the only supported scheme and curve.
    pub fn new(keys: Vec<SecurityClass>) -> Self {
        Self {
            echo: false,
            request_csa: false,
            schemes: vec![KexScheme::Kex1],
            curves: vec![EcdhProfile::Curve25519],
            keys,
        }
    }

    /// Echo copy of these parameters.
    pub fn echoed(&self) -> Self {
        Self {
            echo: true,
            ..self.clone()
        }
    }
}

/// Decoded device command.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    /// Liveness probe
    NoOperation,

    // legacy security
    S0SchemeGet,
    S0SchemeReport,
    S0NonceGet,
    S0NonceReport { nonce: [u8; 8] },
    S0NetworkKeySet { key: NetworkKey },
    S0NetworkKeyVerify,

    // modern security
    KexGet,
    KexReport(KexParameters),
    KexSet(KexParameters),
    KexFail(KexFailType),
    PublicKeyReport {
        including_node: bool,
        public_key: [u8; PUBLIC_KEY_LENGTH],
    },
    NetworkKeyGet { class: SecurityClass },
    NetworkKeyReport { class: SecurityClass, key: NetworkKey },
    NetworkKeyVerify,
    TransferEnd {
        key_verified: bool,
        key_request_complete: bool,
    },

    // lifeline
    AssociationSet { group: u8, node_ids: Vec<NodeId> },
    MultiChannelAssociationSet { group: u8, node_ids: Vec<NodeId> },
    WakeUpIntervalGet,
    WakeUpIntervalReport { seconds: u32, node_id: NodeId },
    WakeUpIntervalSet { seconds: u32, node_id: NodeId },
    WakeUpNoMoreInformation,
}

impl Command {
    /// Short name for logs; never includes key material.
    pub fn name(&self) -> &'static str {
        match self {
            Command::NoOperation => "NoOperation",
            Command::S0SchemeGet => "S0SchemeGet",
            Command::S0SchemeReport => "S0SchemeReport",
            Command::S0NonceGet => "S0NonceGet",
            Command::S0NonceReport { .. } => "S0NonceReport",
            Command::S0NetworkKeySet { .. } => "S0NetworkKeySet",
            Command::S0NetworkKeyVerify => "S0NetworkKeyVerify",
            Command::KexGet => "KexGet",
            Command::KexReport(_) => "KexReport",
            Command::KexSet(_) => "KexSet",
            Command::KexFail(_) => "KexFail",
            Command::PublicKeyReport { .. } => "PublicKeyReport",
            Command::NetworkKeyGet { .. } => "NetworkKeyGet",
            Command::NetworkKeyReport { .. } => "NetworkKeyReport",
            Command::NetworkKeyVerify => "NetworkKeyVerify",
            Command::TransferEnd { .. } => "TransferEnd",
            Command::AssociationSet { .. } => "AssociationSet",
            Command::MultiChannelAssociationSet { .. } => "MultiChannelAssociationSet",
            Command::WakeUpIntervalGet => "WakeUpIntervalGet",
            Command::WakeUpIntervalReport { .. } => "WakeUpIntervalReport",
            Command::WakeUpIntervalSet { .. } => "WakeUpIntervalSet",
            Command::WakeUpNoMoreInformation => "WakeUpNoMoreInformation",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::KexReport(params) | Command::KexSet(params) => {
                write!(f, "{}({:?})", self.name(), params)
            }
            Command::KexFail(reason) => write!(f, "KexFail({:?})", reason),
            Command::NetworkKeyGet { class } | Command::NetworkKeyReport { class, .. } => {
                write!(f, "{} {{ class: {} }}", self.name(), class)
            }
            Command::TransferEnd {
                key_verified,
                key_request_complete,
            } => write!(
                f,
                "TransferEnd {{ key_verified: {}, key_request_complete: {} }}",
                key_verified, key_request_complete
            ),
            Command::AssociationSet { group, node_ids }
            | Command::MultiChannelAssociationSet { group, node_ids } => {
                write!(f, "{} {{ group: {}, node_ids: {:?} }}", self.name(), group, node_ids)
            }
            Command::WakeUpIntervalReport { seconds, node_id }
            | Command::WakeUpIntervalSet { seconds, node_id } => write!(
                f,
                "{} {{ seconds: {}, node_id: {} }}",
                self.name(),
                seconds,
                node_id
            ),
            _ => f.write_str(self.name()),
        }
    }
}

/// How an outbound command is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encapsulation {
    /// Plaintext
    None,
    /// Encrypted under the key of a class; `Temporary` uses the handshake key
    Class(SecurityClass),
    /// Legacy key delivery, encrypted under the receiver's nonce
    S0KeyDelivery { receiver_nonce: [u8; 8] },
}

impl Encapsulation {
    /// Encapsulation for regular traffic to a device, from its strongest class.
    pub fn for_device(device: &Device) -> Self {
        match device.highest_security_class() {
            Some(class) if class >= SecurityClass::S0Legacy => Encapsulation::Class(class),
            _ => Encapsulation::None,
        }
    }
}

/// A command received from a mesh member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub source: NodeId,
    pub command: Command,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_key_material() {
        let key = NetworkKey::from_bytes([0xAB; 16]);
        let command = Command::NetworkKeyReport {
            class: SecurityClass::S2Authenticated,
            key: key.clone(),
        };
        let text = format!("{:?}", command);
        assert!(text.contains("S2_Authenticated"));
        assert!(!text.to_lowercase().contains("abab"));
        assert_eq!(format!("{:?}", Command::S0NetworkKeySet { key }), "S0NetworkKeySet");
    }

    #[test]
    fn test_encapsulation_for_device() {
        let mut device = Device::placeholder(4);
        assert_eq!(Encapsulation::for_device(&device), Encapsulation::None);

        device.set_granted_exactly(&[SecurityClass::S0Legacy]);
        assert_eq!(
            Encapsulation::for_device(&device),
            Encapsulation::Class(SecurityClass::S0Legacy)
        );

        device.set_granted_exactly(&[SecurityClass::S2Unauthenticated, SecurityClass::S0Legacy]);
        assert_eq!(
            Encapsulation::for_device(&device),
            Encapsulation::Class(SecurityClass::S2Unauthenticated)
        );
    }

    #[test]
    fn test_kex_parameters_echo() {
        let params = KexParameters::new(vec![SecurityClass::S2Authenticated]);
        assert!(!params.echo);
        let echo = params.echoed();
        assert!(echo.echo);
        assert_eq!(echo.keys, params.keys);
    }
}
