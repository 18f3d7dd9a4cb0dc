//! Error types for HomeMesh controller operations.
//!
//! Three families live here:
//!
//! - [`TransportError`]: what the radio transport reports for a single
//!   exchange. Never fatal to the controller.
//! - [`ControllerError`]: synchronous rejections of a caller's request.
//! - [`SecurityBootstrapFailure`]: why a bootstrap handshake ended without the
//!   requested security. Returned as data and carried in events, never thrown.

use homemesh_core::NodeId;
use homemesh_crypto::CryptoError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure of a single request/response exchange with the radio.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The destination did not acknowledge the frame
    #[error("Node {node_id} did not acknowledge the message")]
    NoAck { node_id: NodeId },

    /// No route to the destination is known
    #[error("No route to node {node_id}")]
    NoRoute { node_id: NodeId },

    /// The message was dropped before transmission
    #[error("Message dropped: {0}")]
    MessageDropped(String),

    /// No response or unsolicited message arrived in time
    #[error("Timed out waiting for a response")]
    Timeout,

    /// The node acknowledged but never sent the expected report
    #[error("Node {node_id} did not respond in time")]
    NodeTimeout { node_id: NodeId },

    /// The controller firmware lacks the requested function
    #[error("Controller does not support {0}")]
    UnsupportedFunction(&'static str),

    /// The controller reported a failed callback for the request
    #[error("Callback failed: {0}")]
    CallbackFailed(String),

    /// A response of the wrong kind arrived
    #[error("Unexpected response to {request}")]
    UnexpectedResponse { request: &'static str },

    /// The request was discarded because the operation was aborted
    #[error("Request aborted")]
    Aborted,

    /// The transport has shut down
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the error means the frame did not reach its destination.
    pub fn is_transmission_error(&self) -> bool {
        matches!(
            self,
            TransportError::NoAck { .. }
                | TransportError::NoRoute { .. }
                | TransportError::MessageDropped(_)
                | TransportError::Timeout
                | TransportError::NodeTimeout { .. }
        )
    }

    /// Whether a best-effort step may log and continue after this error.
    pub fn is_recoverable(&self) -> bool {
        self.is_transmission_error()
            || matches!(
                self,
                TransportError::UnsupportedFunction(_) | TransportError::CallbackFailed(_)
            )
    }
}

/// Reasons a replace request was refused by the controller firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplaceRejectReason {
    /// This controller is not the primary controller
    NotPrimaryController,
    /// The request carried no callback
    NoCallbackFunction,
    /// The node is not in the failed-node list
    NodeNotFound,
    /// The controller is busy with another operation
    ProcessBusy,
    /// The failed node could not be removed
    RemoveFailed,
    /// Any flag this crate does not know about
    Unknown,
}

impl ReplaceRejectReason {
    const FLAGS: [(u8, ReplaceRejectReason); 5] = [
        (1 << 1, ReplaceRejectReason::NotPrimaryController),
        (1 << 2, ReplaceRejectReason::NoCallbackFunction),
        (1 << 3, ReplaceRejectReason::NodeNotFound),
        (1 << 4, ReplaceRejectReason::ProcessBusy),
        (1 << 5, ReplaceRejectReason::RemoveFailed),
    ];

    /// Decode the start flags of a replace request. `None` means accepted.
    pub fn from_flags(flags: u8) -> Option<Self> {
        if flags == 0 {
            return None;
        }
        Some(
            Self::FLAGS
                .iter()
                .find(|(bit, _)| flags & bit != 0)
                .map(|(_, reason)| *reason)
                .unwrap_or(ReplaceRejectReason::Unknown),
        )
    }
}

impl fmt::Display for ReplaceRejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReplaceRejectReason::NotPrimaryController => "not the primary controller",
            ReplaceRejectReason::NoCallbackFunction => "no callback function",
            ReplaceRejectReason::NodeNotFound => "node is not in the failed node list",
            ReplaceRejectReason::ProcessBusy => "controller is busy",
            ReplaceRejectReason::RemoveFailed => "failed node could not be removed",
            ReplaceRejectReason::Unknown => "unknown reason",
        };
        f.write_str(text)
    }
}

/// Errors returned synchronously to callers of the controller API.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The operation is not allowed in the current inclusion state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No device with this id is known
    #[error("Node {node_id} not found")]
    NodeNotFound { node_id: NodeId },

    /// The controller refused to open the network for joining
    #[error("Inclusion failed: {0}")]
    InclusionFailed(String),

    /// The controller refused to start exclusion
    #[error("Exclusion failed: {0}")]
    ExclusionFailed(String),

    /// The controller refused to replace a failed node
    #[error("Replacing failed node was rejected: {0}")]
    ReplaceFailed(ReplaceRejectReason),

    /// A replace target answered a liveness probe
    #[error("Node {node_id} responded to a ping and is not failed")]
    NodeStillAlive { node_id: NodeId },

    /// The controller does not consider the replace target failed
    #[error("Node {node_id} is not in the failed node list")]
    NodeNotFailed { node_id: NodeId },

    /// SmartStart was requested on a controller that cannot do it
    #[error("Controller does not support SmartStart")]
    SmartStartUnsupported,

    /// A healing run is already in progress
    #[error("Network healing is already active")]
    HealingActive,

    /// Key or DSK handling failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Registry or configuration error
    #[error(transparent)]
    Core(#[from] homemesh_core::Error),

    /// Radio exchange failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Provisioning list could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ControllerError {
    /// Whether a best-effort step may swallow this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ControllerError::Transport(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Why a security bootstrap did not complete with the requested security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityBootstrapFailure {
    /// The user declined the grant or PIN prompt
    UserCanceled,
    /// No network key is configured for the handshake
    NoKeysConfigured,
    /// A grant decision was needed but nobody can answer it
    S2NoUserCallbacks,
    /// A handshake deadline elapsed
    Timeout,
    /// The node asked for a scheme, curve or classes this side cannot provide
    ParameterMismatch,
    /// The node aborted the handshake
    NodeCanceled,
    /// The node's traffic could not be decrypted, usually a wrong PIN
    S2IncorrectPIN,
    /// The node echoed a different set of granted classes
    S2WrongSecurityLevel,
    /// Any other failure
    Unknown,
}

impl fmt::Display for SecurityBootstrapFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        assert!(TransportError::NoAck { node_id: 3 }.is_transmission_error());
        assert!(TransportError::Timeout.is_recoverable());
        assert!(TransportError::UnsupportedFunction("AssignReturnRoute").is_recoverable());
        assert!(!TransportError::UnsupportedFunction("x").is_transmission_error());
        assert!(!TransportError::Aborted.is_recoverable());
        assert!(!TransportError::Closed.is_recoverable());
    }

    #[test]
    fn test_replace_reject_reason_from_flags() {
        assert_eq!(ReplaceRejectReason::from_flags(0), None);
        assert_eq!(
            ReplaceRejectReason::from_flags(1 << 3),
            Some(ReplaceRejectReason::NodeNotFound)
        );
        assert_eq!(
            ReplaceRejectReason::from_flags((1 << 4) | (1 << 5)),
            Some(ReplaceRejectReason::ProcessBusy)
        );
        assert_eq!(
            ReplaceRejectReason::from_flags(1),
            Some(ReplaceRejectReason::Unknown)
        );
    }

    #[test]
    fn test_controller_error_recoverable() {
        let err: ControllerError = TransportError::NoRoute { node_id: 4 }.into();
        assert!(err.is_recoverable());
        assert!(!ControllerError::HealingActive.is_recoverable());
        assert!(err.to_string().contains("No route to node 4"));
    }
}
