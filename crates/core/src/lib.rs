//! Core functionality for the HomeMesh network-management stack.
//!
//! This crate provides the fundamental types shared by the controller:
//! node identifiers, security classes, command-class identifiers, the
//! per-node [`Device`] record and the [`NodeRegistry`] that owns them,
//! together with configuration and logging setup.

pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod registry;
pub mod types;

pub use config::{
    ControllerConfig, ControllerSection, ExclusionSection, HealingSection, LifelineSection,
    LogFormat, LoggingSection, SecuritySection,
};
pub use device::Device;
pub use error::{Error, Result};
pub use registry::NodeRegistry;
pub use types::{
    CommandClass, DeviceClass, ExclusionStrategy, NodeId, NodeStatus, SecurityClass,
    BROADCAST_NODE_ID, MAX_NODE_ID,
};
