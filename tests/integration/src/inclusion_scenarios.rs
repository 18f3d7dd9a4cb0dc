//! Inclusion state machine scenarios
//!
//! # Test Scenarios
//!
//! 1. Only one of inclusion, exclusion and replacement runs at a time
//! 2. SmartStart includes a provisioned node without asking the user
//! 3. Inactive provisioning entries are not included
//! 4. Replacing a failed node runs the modern handshake under the old id
//! 5. Excluding a node drops it from the registry

use crate::test_utils::{all_keys, TestMesh};
use homemesh_core::{Device, SecurityClass};
use homemesh_mesh::testing::{ScriptedCallbacks, SimNode};
use homemesh_mesh::{
    AddNodeMode, Command, ControllerEvent, ControllerNotification, InclusionOptions, InclusionState,
    InclusionStrategy, ProvisioningEntry, ProvisioningStatus, RemoveNodeReport, RemoveNodeStatus,
    ReplaceNodeStatus, ReplaceOptions, ReplaceStrategy, Request,
};
use std::sync::Arc;

fn opens_network(request: &Request, expected: AddNodeMode) -> bool {
    matches!(request, Request::AddNode { mode, .. } if *mode == expected)
}

#[tokio::test(start_paused = true)]
async fn test_inclusion_refused_while_excluding() {
    let mesh = TestMesh::new(all_keys());

    assert!(mesh.controller.begin_exclusion(None).await.unwrap());
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Excluding);
    let before = mesh.network.requests().len();

    assert!(!mesh
        .controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap());
    assert!(!mesh
        .controller
        .replace_failed_node(4, ReplaceOptions::new(ReplaceStrategy::Insecure))
        .await
        .unwrap());
    assert_eq!(mesh.network.requests().len(), before);
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Excluding);

    assert!(mesh.controller.stop_exclusion().await.unwrap());
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_operations_are_mutually_exclusive() {
    let mesh = TestMesh::new(all_keys());

    assert!(mesh
        .controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap());
    assert!(!mesh
        .controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap());
    assert!(!mesh.controller.begin_exclusion(None).await.unwrap());
    assert!(!mesh.controller.stop_exclusion().await.unwrap());
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Including);

    assert!(mesh.controller.stop_inclusion().await.unwrap());
    assert!(!mesh.controller.stop_inclusion().await.unwrap());
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Idle);

    assert!(mesh.controller.begin_exclusion(None).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_smart_start_includes_provisioned_node() {
    let mut mesh = TestMesh::new(all_keys());
    let node = SimNode::listening(5).with_s2(vec![SecurityClass::S2Authenticated]);
    let dsk = node.dsk().unwrap();
    mesh.network.add_node(node.clone());

    mesh.controller
        .provision_smart_start_node(ProvisioningEntry::new(
            dsk.to_string(),
            vec![SecurityClass::S2Authenticated],
        ))
        .await
        .unwrap();
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::SmartStart);
    assert!(mesh
        .network
        .requests()
        .iter()
        .any(|request| opens_network(request, AddNodeMode::SmartStartListen)));

    mesh.notify(ControllerNotification::SmartStartRequest {
        nwi_home_id: dsk.nwi_home_id(),
        node_info: Some(node.node_info()),
    })
    .await;
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Including);
    assert!(mesh.network.requests().iter().any(|request| opens_network(
        request,
        AddNodeMode::SmartStartInclude {
            nwi_home_id: dsk.nwi_home_id()
        }
    )));

    mesh.join(&node).await;

    let result = mesh.added(5).unwrap();
    assert!(!result.low_security);
    assert_eq!(mesh.granted(5), vec![SecurityClass::S2Authenticated]);
    assert!(mesh
        .network
        .received_class_key(5, SecurityClass::S2Authenticated));
    let entry = mesh
        .controller
        .get_provisioning_entry(dsk.to_string())
        .unwrap();
    assert_eq!(entry.node_id, Some(5));
    assert_eq!(mesh.controller.get_provisioning_entry(5u16).unwrap().dsk, entry.dsk);
    // nothing left to wait for
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_inactive_entry_is_not_included() {
    let mesh = TestMesh::new(all_keys());
    let node = SimNode::listening(5).with_s2(vec![SecurityClass::S2Unauthenticated]);
    let dsk = node.dsk().unwrap();
    mesh.network.add_node(node.clone());

    let mut entry = ProvisioningEntry::new(dsk.to_string(), vec![SecurityClass::S2Unauthenticated]);
    entry.status = ProvisioningStatus::Inactive;
    mesh.controller.provision_smart_start_node(entry).await.unwrap();
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Idle);

    mesh.notify(ControllerNotification::SmartStartRequest {
        nwi_home_id: dsk.nwi_home_id(),
        node_info: None,
    })
    .await;
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Idle);
    assert!(mesh.network.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_list_survives_restart() {
    let mesh = TestMesh::new(all_keys());
    let node = SimNode::listening(5).with_s2(vec![SecurityClass::S2Unauthenticated]);
    let dsk = node.dsk().unwrap().to_string();
    mesh.controller
        .provision_smart_start_node(ProvisioningEntry::new(
            dsk.clone(),
            vec![SecurityClass::S2Unauthenticated],
        ))
        .await
        .unwrap();

    let json = mesh.controller.provisioning_list().to_json().unwrap();
    let restarted = TestMesh::new(all_keys());
    restarted
        .controller
        .restore_provisioning_list(serde_json::from_str(&json).unwrap());

    let entries = restarted.controller.provisioning_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].dsk, dsk);
    assert!(entries[0].is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_replace_failed_node_with_modern_security() {
    let callbacks = Arc::new(ScriptedCallbacks::granting(
        vec![SecurityClass::S2Unauthenticated],
        None,
    ));
    let mut mesh = TestMesh::new(all_keys());
    let mut old = Device::placeholder(4);
    old.set_granted_exactly(&[SecurityClass::S0Legacy]);
    mesh.controller.add_node(old).unwrap();
    let replacement = SimNode::listening(4).with_s2(vec![SecurityClass::S2Unauthenticated]);
    mesh.network.add_node(replacement);
    mesh.network.set_reachable(4, false);

    assert!(mesh
        .controller
        .replace_failed_node(
            4,
            ReplaceOptions::new(ReplaceStrategy::SecurityS2).with_user_callbacks(callbacks),
        )
        .await
        .unwrap());
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Busy);

    mesh.network.set_reachable(4, true);
    for status in [
        ReplaceNodeStatus::FailedNodeReplace,
        ReplaceNodeStatus::FailedNodeReplaceDone,
    ] {
        mesh.notify(ControllerNotification::ReplaceFailedNode { node_id: 4, status })
            .await;
    }

    let events = mesh.drain_events();
    assert!(events.contains(&ControllerEvent::NodeRemoved {
        node_id: 4,
        replaced: true
    }));
    let added = events.iter().find_map(|event| match event {
        ControllerEvent::NodeAdded { node_id: 4, result } => Some(*result),
        _ => None,
    });
    assert!(!added.unwrap().low_security);
    assert_eq!(mesh.granted(4), vec![SecurityClass::S2Unauthenticated]);
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_excluded_node_leaves_registry() {
    let mut mesh = TestMesh::new(all_keys());
    mesh.register(SimNode::listening(9));

    assert!(mesh.controller.begin_exclusion(None).await.unwrap());
    mesh.notify(ControllerNotification::RemoveNode(RemoveNodeReport {
        status: RemoveNodeStatus::RemovingSlave,
        node_id: Some(9),
    }))
    .await;
    mesh.notify(ControllerNotification::RemoveNode(RemoveNodeReport {
        status: RemoveNodeStatus::Done,
        node_id: None,
    }))
    .await;

    assert!(mesh.controller.node(9).is_none());
    assert!(mesh.drain_events().contains(&ControllerEvent::NodeRemoved {
        node_id: 9,
        replaced: false
    }));
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_forced_insecure_inclusion_skips_handshake() {
    let mut mesh = TestMesh::new(all_keys());
    let node = SimNode::listening(5).with_s2(vec![SecurityClass::S2Unauthenticated]);
    mesh.network.add_node(node.clone());

    mesh.controller
        .begin_inclusion(InclusionOptions::new(InclusionStrategy::Insecure))
        .await
        .unwrap();
    mesh.join(&node).await;

    assert!(!mesh.added(5).unwrap().low_security);
    assert!(mesh.granted(5).is_empty());
    assert_eq!(mesh.network.kex_fail_received(5), None);
    assert!(!mesh.network.commands_to(5).contains(&Command::KexGet));
}
