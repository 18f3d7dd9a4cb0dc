//! HomeMesh Mesh - network management core of a home-automation controller
//!
//! Owns the lifecycle of mesh members: adding and removing them, bootstrapping
//! trust keys with each one, and keeping routes usable as the mesh changes.
//!
//! # Core Components
//!
//! - **Inclusion Controller**: a single state machine for inclusion, exclusion,
//!   replacement and SmartStart listening
//! - **Security Bootstrap**: the legacy single-key handshake and the modern
//!   per-class X25519 handshake with cancellation
//! - **Lifeline Bootstrap**: association, return route and wake-up destination
//!   for every new node
//! - **Provisioning List**: pre-approved SmartStart devices keyed by DSK
//! - **Network Healing**: breadth-first neighbor and route refresh with a
//!   fixed retry budget per step
//!
//! All radio traffic goes through the [`Transport`] trait; network keys come
//! from a [`KeyStore`](homemesh_crypto::KeyStore).
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use homemesh_core::ControllerConfig;
//! use homemesh_crypto::SecurityManager;
//! use homemesh_mesh::{Controller, InclusionOptions, Transport};
//! use std::sync::Arc;
//!
//! # async fn run(transport: Arc<dyn Transport>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControllerConfig::from_file("homemesh.toml")?;
//! let keys = Arc::new(SecurityManager::from_config(&config.security)?);
//! let controller = Controller::new(config, transport, keys);
//!
//! let mut events = controller.subscribe();
//! controller.begin_inclusion(InclusionOptions::default()).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub(crate) mod bootstrap;
pub mod callbacks;
pub mod command;
pub mod controller;
pub mod error;
pub mod events;
pub mod healing;
pub mod inclusion;
pub mod lifeline;
pub mod provisioning;
pub mod state;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export main types
pub use callbacks::{GrantRequest, InclusionUserCallbacks};
pub use command::{Command, Encapsulation, InboundCommand, KexFailType, KexParameters};
pub use controller::{BootstrapCanceller, Controller};
pub use error::{
    ControllerError, ControllerResult, ReplaceRejectReason, SecurityBootstrapFailure,
    TransportError,
};
pub use events::{ControllerEvent, InclusionResult};
pub use healing::{return_route_destinations, HealNetworkOptions, HealStatus, MAX_RETURN_ROUTES};
pub use lifeline::LIFELINE_GROUP;
pub use provisioning::{ProvisioningEntry, ProvisioningKey, ProvisioningList, ProvisioningStatus};
pub use state::{InclusionOptions, InclusionState, InclusionStrategy, ReplaceOptions, ReplaceStrategy};
pub use transport::{
    AddNodeMode, AddNodeReport, AddNodeStatus, ControllerNotification, NeighborUpdateStatus,
    NodeInfo, RemoveNodeMode, RemoveNodeReport, RemoveNodeStatus, ReplaceNodeStatus, Request,
    Response, Transport,
};
