//! Core error types

use crate::types::NodeId;
use thiserror::Error;

/// Core error type for HomeMesh
#[derive(Debug, Error)]
pub enum Error {
    /// No device with this id is known to the registry
    #[error("Node {node_id} not found")]
    NodeNotFound {
        /// Requested node id
        node_id: NodeId,
    },

    /// Node id outside the addressable range
    #[error("Invalid node id: {0}")]
    InvalidNodeId(NodeId),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;
