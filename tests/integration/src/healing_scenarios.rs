//! Network healing scenarios
//!
//! # Test Scenarios
//!
//! 1. A five node mesh with one dead member heals everything else
//! 2. A node whose neighbor update keeps failing does not stop the run
//! 3. A background run reports progress and exactly one summary
//! 4. Healing and inclusion never run at the same time

use crate::test_utils::{all_keys, TestMesh};
use homemesh_core::NodeStatus;
use homemesh_mesh::testing::SimNode;
use homemesh_mesh::{
    Command, ControllerError, ControllerEvent, ControllerNotification, HealNetworkOptions,
    HealStatus, InclusionOptions, InclusionState, Request,
};
use std::collections::BTreeMap;
use std::time::Duration;

async fn five_node_mesh() -> TestMesh {
    let mesh = TestMesh::new(all_keys());
    mesh.register(SimNode::listening(2).with_neighbors([1, 3, 4]));
    mesh.register(SimNode::listening(3).with_neighbors([2]));
    mesh.register(SimNode::listening(4).with_neighbors([2, 5]));
    mesh.register(SimNode::listening(5).with_neighbors([4]));
    mesh.register(SimNode::sleeping(6));
    mesh.network.set_controller_neighbors([2]);

    mesh.network.set_reachable(3, false);
    mesh.notify(ControllerNotification::NodeStatus {
        node_id: 3,
        status: NodeStatus::Dead,
    })
    .await;
    mesh
}

fn summaries(events: &[ControllerEvent]) -> Vec<BTreeMap<u16, HealStatus>> {
    events
        .iter()
        .filter_map(|event| match event {
            ControllerEvent::HealNetworkDone(progress) => Some(progress.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_dead_node_is_skipped() {
    let mut mesh = five_node_mesh().await;

    let progress = mesh
        .controller
        .heal_network(HealNetworkOptions {
            include_sleeping: true,
        })
        .await
        .unwrap();

    assert_eq!(progress[&3], HealStatus::Skipped);
    for node_id in [2, 4, 5, 6] {
        assert_eq!(progress[&node_id], HealStatus::Done, "node {node_id}");
    }
    assert!(!mesh.network.requests().iter().any(|request| matches!(
        request,
        Request::RequestNeighborUpdate { node_id: 3 }
    )));
    assert!(mesh
        .network
        .commands_to(6)
        .contains(&Command::WakeUpNoMoreInformation));
    assert_eq!(mesh.controller.node(3).unwrap().status, NodeStatus::Dead);

    let done = summaries(&mesh.drain_events());
    assert_eq!(done, vec![progress]);
    assert!(!mesh.controller.is_healing_active());
}

#[tokio::test(start_paused = true)]
async fn test_failing_node_does_not_stop_the_run() {
    let mesh = TestMesh::new(all_keys());
    mesh.register(SimNode::listening(2));
    mesh.register(SimNode::listening(3).with_failing_neighbor_update());
    mesh.register(SimNode::listening(4));

    let progress = mesh
        .controller
        .heal_network(mesh.controller.heal_network_options())
        .await
        .unwrap();

    assert_eq!(progress[&3], HealStatus::Failed);
    assert_eq!(progress[&2], HealStatus::Done);
    assert_eq!(progress[&4], HealStatus::Done);
    // the controller keeps its own routes
    assert!(!progress.contains_key(&1));
}

#[tokio::test(start_paused = true)]
async fn test_background_run_reports_progress() {
    let mut mesh = five_node_mesh().await;
    mesh.controller
        .begin_healing_network(mesh.controller.heal_network_options())
        .unwrap();
    assert!(mesh.controller.is_healing_active());

    let finished = tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match mesh.events.recv().await {
                Ok(ControllerEvent::HealNetworkDone(progress)) => break progress,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("healing never finished");

    assert_eq!(finished.len(), 5);
    assert_eq!(finished[&3], HealStatus::Skipped);
    assert!(!mesh.controller.is_healing_active());
    assert_eq!(mesh.controller.heal_progress(), finished);

    // settle, then make sure no second summary follows
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!mesh.controller.stop_healing());
    assert!(summaries(&mesh.drain_events()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_healing_and_inclusion_exclude_each_other() {
    let mesh = TestMesh::new(all_keys());
    mesh.register(SimNode::listening(2).with_delay_ms(500));

    assert!(mesh
        .controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap());
    assert!(matches!(
        mesh.controller
            .heal_network(mesh.controller.heal_network_options())
            .await,
        Err(ControllerError::InvalidState(_))
    ));
    assert!(!mesh
        .network
        .requests()
        .iter()
        .any(|request| matches!(request, Request::RequestNeighborUpdate { .. })));
    assert!(mesh.controller.stop_inclusion().await.unwrap());

    mesh.controller
        .begin_healing_network(mesh.controller.heal_network_options())
        .unwrap();
    tokio::task::yield_now().await;
    assert!(!mesh
        .controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap());
    assert_eq!(mesh.controller.inclusion_state(), InclusionState::Idle);

    assert!(mesh.controller.stop_healing());
    assert!(mesh
        .controller
        .begin_inclusion(InclusionOptions::default())
        .await
        .unwrap());
}
