//! User interaction during the modern bootstrap handshake.

use async_trait::async_trait;
use homemesh_core::SecurityClass;

/// Classes a joining node asks for, presented to the user for a grant decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    /// Requested classes this controller can grant, strongest first
    pub security_classes: Vec<SecurityClass>,
    /// The node asks for client-side authentication
    pub client_side_auth: bool,
}

/// Answers the questions the modern handshake asks a human.
///
/// Returning `None` from either prompt cancels the handshake. Both prompts
/// run under the handshake's deadlines; an answer that arrives late is
/// treated as a cancellation.
#[async_trait]
pub trait InclusionUserCallbacks: Send + Sync {
    /// Pick which of the requested classes to grant.
    async fn grant_security_classes(&self, request: GrantRequest) -> Option<Vec<SecurityClass>>;

    /// Show the DSK without its PIN block and ask for the 5-digit PIN.
    async fn validate_dsk_and_enter_pin(&self, masked_dsk: String) -> Option<String>;

    /// The handshake was aborted; close any open prompt.
    fn abort(&self);
}
