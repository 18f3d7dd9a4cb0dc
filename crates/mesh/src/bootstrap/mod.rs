//! Security bootstrap handshakes.
//!
//! - [`s0`]: legacy single shared key, one round trip
//! - [`s2`]: modern per-class keys over an X25519 key exchange
//!
//! Both return `None` on success or the [`SecurityBootstrapFailure`] that
//! ended them. Failures are recorded on the device, never thrown.
//!
//! [`SecurityBootstrapFailure`]: crate::error::SecurityBootstrapFailure

pub(crate) mod cancel;
pub(crate) mod s0;
pub(crate) mod s2;
