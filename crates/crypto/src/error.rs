//! Error types for key handling and key exchange.

use homemesh_core::SecurityClass;
use thiserror::Error;

/// Errors raised by the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// DSK string or bytes are malformed
    #[error("Invalid DSK: {0}")]
    InvalidDsk(String),

    /// PIN is not a 5-digit decimal number in range
    #[error("Invalid PIN: {0}")]
    InvalidPin(String),

    /// Key material has the wrong length or encoding
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Diffie-Hellman step failed
    #[error("Key exchange failed: {0}")]
    KeyExchange(String),

    /// No key configured for a security class
    #[error("No key configured for {0}")]
    MissingKey(SecurityClass),
}

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
