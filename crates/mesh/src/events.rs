//! Controller event stream
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel. Slow
//! subscribers lose the oldest events rather than blocking the controller.

use crate::error::SecurityBootstrapFailure;
use crate::healing::HealStatus;
use crate::state::InclusionState;
use homemesh_core::{CommandClass, DeviceClass, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

/// Outcome of the security part of an inclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InclusionResult {
    /// The node ended up with less security than it asked for
    pub low_security: bool,
    pub low_security_reason: Option<SecurityBootstrapFailure>,
}

impl InclusionResult {
    /// Result of a bootstrap that ended with `failure`.
    pub fn from_failure(failure: Option<SecurityBootstrapFailure>) -> Self {
        Self {
            low_security: failure.is_some(),
            low_security_reason: failure,
        }
    }
}

/// Notification emitted by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ControllerEvent {
    InclusionStateChanged(InclusionState),
    InclusionStarted {
        secure: bool,
    },
    InclusionStopped,
    InclusionFailed,
    ExclusionStarted,
    ExclusionStopped,
    ExclusionFailed,
    NodeFound {
        node_id: NodeId,
        device_class: Option<DeviceClass>,
        supported: Vec<CommandClass>,
    },
    NodeAdded {
        node_id: NodeId,
        result: InclusionResult,
    },
    NodeRemoved {
        node_id: NodeId,
        replaced: bool,
    },
    HealNetworkProgress(BTreeMap<NodeId, HealStatus>),
    HealNetworkDone(BTreeMap<NodeId, HealStatus>),
}

pub(crate) struct EventBus {
    tx: broadcast::Sender<ControllerEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: ControllerEvent) {
        // no subscribers is fine
        if self.tx.send(event).is_err() {
            trace!("Event dropped, no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(ControllerEvent::InclusionStarted { secure: true });
        bus.emit(ControllerEvent::InclusionStopped);

        assert_eq!(
            rx.recv().await.unwrap(),
            ControllerEvent::InclusionStarted { secure: true }
        );
        assert_eq!(rx.recv().await.unwrap(), ControllerEvent::InclusionStopped);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(ControllerEvent::ExclusionStarted);
    }

    #[test]
    fn test_event_serialization() {
        let event = ControllerEvent::NodeAdded {
            node_id: 6,
            result: InclusionResult::from_failure(Some(SecurityBootstrapFailure::Timeout)),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"node_added\""));
        assert!(json.contains("\"low_security\":true"));
        assert!(json.contains("Timeout"));
    }
}
