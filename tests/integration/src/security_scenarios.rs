//! Security bootstrap scenarios
//!
//! # Test Scenarios
//!
//! 1. Authenticated inclusion with the PIN printed on the device
//! 2. Legacy inclusion of a lock that mandates security
//! 3. A mistyped PIN ends the handshake with nothing granted
//! 4. A node echoing other classes than granted is rejected
//! 5. Missing network keys leave the node insecure without radio traffic

use crate::test_utils::{all_keys, TestMesh};
use homemesh_core::{CommandClass, DeviceClass, SecurityClass};
use homemesh_crypto::{NetworkKey, SecurityManager};
use homemesh_mesh::testing::{ScriptedCallbacks, SimNode};
use homemesh_mesh::{
    Command, InclusionOptions, InclusionState, InclusionStrategy, KexFailType,
    SecurityBootstrapFailure,
};
use std::sync::Arc;

fn legacy_only() -> SecurityManager {
    SecurityManager::new().with_key(SecurityClass::S0Legacy, NetworkKey::generate())
}

/// Same PIN with the last digit changed.
fn mistype(pin: &str) -> String {
    let value: u16 = pin.parse().expect("PIN is numeric");
    format!("{:05}", value ^ 1)
}

#[tokio::test(start_paused = true)]
async fn test_authenticated_inclusion_with_pin() {
    let node = SimNode::listening(5).with_s2(vec![SecurityClass::S2Authenticated]);
    let dsk = node.dsk().unwrap();
    let callbacks = Arc::new(ScriptedCallbacks::granting(
        vec![SecurityClass::S2Authenticated],
        node.pin(),
    ));
    let mut mesh = TestMesh::with_callbacks(all_keys(), callbacks.clone());
    mesh.network.add_node(node.clone());

    assert!(mesh
        .controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap());
    mesh.join(&node).await;

    let result = mesh.added(5).expect("node was not added");
    assert!(!result.low_security);
    assert_eq!(result.low_security_reason, None);
    assert_eq!(mesh.granted(5), vec![SecurityClass::S2Authenticated]);
    assert!(mesh
        .network
        .received_class_key(5, SecurityClass::S2Authenticated));

    let device = mesh.controller.node(5).unwrap();
    assert_eq!(device.dsk, Some(*dsk.as_bytes()));
    assert_eq!(
        device.highest_security_class(),
        Some(SecurityClass::S2Authenticated)
    );
    assert_eq!(callbacks.pin_prompts(), 1);
    assert_eq!(callbacks.masked_dsk(), Some(dsk.masked()));
    assert!(!callbacks.was_aborted());
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_every_requested_class_is_delivered() {
    let requested = vec![
        SecurityClass::S2AccessControl,
        SecurityClass::S2Authenticated,
        SecurityClass::S2Unauthenticated,
        SecurityClass::S0Legacy,
    ];
    let node = SimNode::listening(6).with_s2(requested.clone());
    let callbacks = Arc::new(ScriptedCallbacks::granting(requested.clone(), node.pin()));
    let mut mesh = TestMesh::with_callbacks(all_keys(), callbacks);
    mesh.network.add_node(node.clone());

    mesh.controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap();
    mesh.join(&node).await;

    assert!(!mesh.added(6).unwrap().low_security);
    assert_eq!(mesh.granted(6), requested);
    for class in &requested {
        assert!(mesh.network.received_class_key(6, *class), "{class} missing");
    }
}

#[tokio::test(start_paused = true)]
async fn test_legacy_inclusion_of_mandating_device() {
    let lock = SimNode::listening(7)
        .with_device_class(DeviceClass::new(0x04, 0x40, 0x03))
        .with_s0();
    let mut mesh = TestMesh::new(legacy_only());
    mesh.network.add_node(lock.clone());

    mesh.controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap();
    mesh.join(&lock).await;

    let result = mesh.added(7).unwrap();
    assert!(!result.low_security);
    assert!(mesh.network.received_s0_key(7));
    assert_eq!(mesh.granted(7), vec![SecurityClass::S0Legacy]);
    assert_eq!(
        mesh.controller.node(7).unwrap().security_class(SecurityClass::S2Authenticated),
        Some(false)
    );
}

#[tokio::test(start_paused = true)]
async fn test_legacy_device_without_mandate_joins_insecure() {
    let switch = SimNode::listening(8).with_s0();
    let mut mesh = TestMesh::new(legacy_only());
    mesh.network.add_node(switch.clone());

    mesh.controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap();
    mesh.join(&switch).await;

    assert!(!mesh.added(8).unwrap().low_security);
    assert!(!mesh.network.received_s0_key(8));
    assert!(mesh.granted(8).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_wrong_pin_grants_nothing() {
    let node = SimNode::listening(5).with_s2(vec![SecurityClass::S2Authenticated]);
    let wrong = mistype(&node.pin().unwrap());
    let callbacks = Arc::new(ScriptedCallbacks::granting(
        vec![SecurityClass::S2Authenticated],
        Some(wrong),
    ));
    let mut mesh = TestMesh::with_callbacks(all_keys(), callbacks.clone());
    mesh.network.add_node(node.clone());

    mesh.controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap();
    mesh.join(&node).await;

    let result = mesh.added(5).unwrap();
    assert!(result.low_security);
    assert_eq!(
        result.low_security_reason,
        Some(SecurityBootstrapFailure::S2IncorrectPIN)
    );
    assert!(mesh.granted(5).is_empty());
    assert!(!mesh.controller.node(5).unwrap().supports(CommandClass::Security2));
    assert_eq!(mesh.network.kex_fail_received(5), Some(KexFailType::Decrypt));
    assert!(callbacks.was_aborted());
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_echo_mismatch_is_wrong_security_level() {
    let node = SimNode::listening(5)
        .with_s2(vec![
            SecurityClass::S2Authenticated,
            SecurityClass::S2Unauthenticated,
        ])
        .with_echo(vec![SecurityClass::S2Unauthenticated]);
    let callbacks = Arc::new(ScriptedCallbacks::granting(
        vec![
            SecurityClass::S2Authenticated,
            SecurityClass::S2Unauthenticated,
        ],
        node.pin(),
    ));
    let mut mesh = TestMesh::with_callbacks(all_keys(), callbacks);
    mesh.network.add_node(node.clone());

    mesh.controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap();
    mesh.join(&node).await;

    let result = mesh.added(5).unwrap();
    assert_eq!(
        result.low_security_reason,
        Some(SecurityBootstrapFailure::S2WrongSecurityLevel)
    );
    assert!(mesh.granted(5).is_empty());
    assert_eq!(
        mesh.network.kex_fail_received(5),
        Some(KexFailType::WrongSecurityLevel)
    );
    assert!(!mesh
        .network
        .received_class_key(5, SecurityClass::S2Unauthenticated));
}

#[tokio::test(start_paused = true)]
async fn test_modern_node_without_modern_keys() {
    let node = SimNode::listening(5).with_s2(vec![SecurityClass::S2Unauthenticated]);
    let callbacks = Arc::new(ScriptedCallbacks::granting(
        vec![SecurityClass::S2Unauthenticated],
        None,
    ));
    let mut mesh = TestMesh::with_callbacks(legacy_only(), callbacks.clone());
    mesh.network.add_node(node.clone());

    mesh.controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap();
    mesh.join(&node).await;

    let result = mesh.added(5).unwrap();
    assert_eq!(
        result.low_security_reason,
        Some(SecurityBootstrapFailure::NoKeysConfigured)
    );
    assert!(mesh.granted(5).is_empty());
    assert!(!mesh.network.commands_to(5).contains(&Command::KexGet));
    assert_eq!(callbacks.pin_prompts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_forced_legacy_without_key() {
    let node = SimNode::listening(5).with_s0();
    let mut mesh = TestMesh::new(SecurityManager::new());
    mesh.network.add_node(node.clone());

    mesh.controller
        .begin_inclusion(InclusionOptions::new(InclusionStrategy::SecurityS0))
        .await
        .unwrap();
    mesh.join(&node).await;

    let result = mesh.added(5).unwrap();
    assert_eq!(
        result.low_security_reason,
        Some(SecurityBootstrapFailure::NoKeysConfigured)
    );
    assert!(!mesh
        .network
        .commands_to(5)
        .iter()
        .any(|command| matches!(command, Command::S0SchemeGet | Command::S0NonceGet)));
    assert!(mesh.granted(5).is_empty());
}
