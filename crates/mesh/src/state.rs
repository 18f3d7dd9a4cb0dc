//! Inclusion state machine.
//!
//! [`InclusionState`] is what callers observe. Internally the controller keeps
//! a [`Phase`], which carries the data that only exists while an operation
//! runs (pending device, replace target, cancel handle of the running
//! handshake). Leaving a phase drops that data with it.

use crate::bootstrap::cancel::CancelSender;
use crate::callbacks::InclusionUserCallbacks;
use crate::provisioning::ProvisioningEntry;
use homemesh_core::{Device, ExclusionStrategy, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Observable state of the inclusion controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InclusionState {
    #[default]
    Idle,
    Including,
    Excluding,
    Busy,
    SmartStart,
}

impl InclusionState {
    /// Idle or passively listening for SmartStart; both accept new operations.
    pub fn is_available(self) -> bool {
        matches!(self, InclusionState::Idle | InclusionState::SmartStart)
    }
}

impl fmt::Display for InclusionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Security policy for a new inclusion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InclusionStrategy {
    /// Modern handshake if supported, else legacy if the device class mandates it
    #[default]
    Default,
    Insecure,
    /// Force the legacy handshake
    SecurityS0,
    /// Force the modern handshake, optionally driven by a provisioning entry
    SecurityS2 {
        provisioning: Option<ProvisioningEntry>,
    },
}

impl InclusionStrategy {
    pub fn is_secure(&self) -> bool {
        !matches!(self, InclusionStrategy::Insecure)
    }
}

/// Security policy for a replacement. No node information is available for
/// a replacement, so the handshake is named explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStrategy {
    Insecure,
    SecurityS0,
    SecurityS2,
}

/// Options of a new inclusion.
#[derive(Clone, Default)]
pub struct InclusionOptions {
    pub strategy: InclusionStrategy,
    /// Overrides the controller-wide callbacks for this inclusion
    pub user_callbacks: Option<Arc<dyn InclusionUserCallbacks>>,
}

impl InclusionOptions {
    pub fn new(strategy: InclusionStrategy) -> Self {
        Self {
            strategy,
            user_callbacks: None,
        }
    }

    pub fn with_user_callbacks(mut self, callbacks: Arc<dyn InclusionUserCallbacks>) -> Self {
        self.user_callbacks = Some(callbacks);
        self
    }
}

impl fmt::Debug for InclusionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InclusionOptions")
            .field("strategy", &self.strategy)
            .field("user_callbacks", &self.user_callbacks.is_some())
            .finish()
    }
}

/// Options of a replacement.
#[derive(Clone)]
pub struct ReplaceOptions {
    pub strategy: ReplaceStrategy,
    pub user_callbacks: Option<Arc<dyn InclusionUserCallbacks>>,
}

impl ReplaceOptions {
    pub fn new(strategy: ReplaceStrategy) -> Self {
        Self {
            strategy,
            user_callbacks: None,
        }
    }

    pub fn with_user_callbacks(mut self, callbacks: Arc<dyn InclusionUserCallbacks>) -> Self {
        self.user_callbacks = Some(callbacks);
        self
    }
}

impl fmt::Debug for ReplaceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplaceOptions")
            .field("strategy", &self.strategy)
            .field("user_callbacks", &self.user_callbacks.is_some())
            .finish()
    }
}

/// What the network is open for while including.
#[derive(Debug)]
pub(crate) enum Joining {
    /// A new node
    New {
        options: InclusionOptions,
        pending: Option<Device>,
    },
    /// The replacement of a failed node
    Replacement {
        node_id: NodeId,
        options: ReplaceOptions,
    },
}

/// Handle to the running modern handshake.
#[derive(Debug)]
pub(crate) struct SessionHandle {
    pub(crate) node_id: NodeId,
    pub(crate) cancel: CancelSender,
}

/// Internal controller phase.
#[derive(Debug, Default)]
pub(crate) enum Phase {
    #[default]
    Idle,
    SmartStart,
    Including(Joining),
    Excluding {
        strategy: ExclusionStrategy,
        node_id: Option<NodeId>,
    },
    /// Replace accepted, waiting for the controller to confirm the node is failed
    Replacing {
        node_id: NodeId,
        options: ReplaceOptions,
    },
    /// Bootstrapping a node that just joined
    Busy {
        node_id: NodeId,
        session: Option<SessionHandle>,
    },
}

impl Phase {
    pub(crate) fn state(&self) -> InclusionState {
        match self {
            Phase::Idle => InclusionState::Idle,
            Phase::SmartStart => InclusionState::SmartStart,
            Phase::Including(_) => InclusionState::Including,
            Phase::Excluding { .. } => InclusionState::Excluding,
            Phase::Replacing { .. } | Phase::Busy { .. } => InclusionState::Busy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_maps_to_state() {
        assert_eq!(Phase::Idle.state(), InclusionState::Idle);
        assert_eq!(
            Phase::Replacing {
                node_id: 4,
                options: ReplaceOptions::new(ReplaceStrategy::Insecure)
            }
            .state(),
            InclusionState::Busy
        );
        assert_eq!(
            Phase::Including(Joining::New {
                options: InclusionOptions::default(),
                pending: None
            })
            .state(),
            InclusionState::Including
        );
    }

    #[test]
    fn test_available_states() {
        assert!(InclusionState::Idle.is_available());
        assert!(InclusionState::SmartStart.is_available());
        assert!(!InclusionState::Busy.is_available());
        assert!(!InclusionState::Excluding.is_available());
    }

    #[test]
    fn test_strategy_security() {
        assert!(InclusionStrategy::Default.is_secure());
        assert!(!InclusionStrategy::Insecure.is_secure());
    }
}
