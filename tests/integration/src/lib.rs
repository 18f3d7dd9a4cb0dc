//! End-to-end tests for the HomeMesh controller
//!
//! This test suite drives a [`Controller`](homemesh_mesh::Controller) against a
//! simulated mesh and validates:
//! - Inclusion with the legacy and modern security handshakes
//! - Handshake failures surfacing as low-security inclusions
//! - SmartStart inclusion from the provisioning list
//! - Mutual exclusion of inclusion, exclusion and replacement
//! - Network-wide healing with dead and sleeping members

pub mod test_utils;

#[cfg(test)]
mod security_scenarios;

#[cfg(test)]
mod inclusion_scenarios;

#[cfg(test)]
mod healing_scenarios;
