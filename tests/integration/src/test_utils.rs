//! Fixtures shared by the end-to-end scenarios

use homemesh_core::{ControllerConfig, Device, NodeStatus, SecurityClass};
use homemesh_crypto::{NetworkKey, SecurityManager};
use homemesh_mesh::testing::{SimNode, SimulatedNetwork};
use homemesh_mesh::{
    AddNodeReport, AddNodeStatus, Controller, ControllerEvent, ControllerNotification,
    InclusionResult, InclusionUserCallbacks,
};
use std::sync::{Arc, Once};
use tokio::sync::broadcast;

static TRACING: Once = Once::new();

/// Route controller logs to the test harness. `RUST_LOG` picks the level.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Key store holding a fresh key for every class.
pub fn all_keys() -> SecurityManager {
    SecurityClass::GRANTABLE
        .iter()
        .fold(SecurityManager::new(), |keys, class| {
            keys.with_key(*class, NetworkKey::generate())
        })
}

/// A controller wired to a simulated mesh.
pub struct TestMesh {
    pub network: Arc<SimulatedNetwork>,
    pub controller: Arc<Controller>,
    pub events: broadcast::Receiver<ControllerEvent>,
}

impl TestMesh {
    pub fn new(keys: SecurityManager) -> Self {
        Self::build(keys, None)
    }

    /// Controller with controller-wide user callbacks.
    pub fn with_callbacks(keys: SecurityManager, callbacks: Arc<dyn InclusionUserCallbacks>) -> Self {
        Self::build(keys, Some(callbacks))
    }

    fn build(keys: SecurityManager, callbacks: Option<Arc<dyn InclusionUserCallbacks>>) -> Self {
        init_tracing();
        let keys = Arc::new(keys);
        let network = Arc::new(SimulatedNetwork::new(keys.clone()));
        let mut controller = Controller::new(ControllerConfig::default(), network.clone(), keys);
        if let Some(callbacks) = callbacks {
            controller = controller.with_user_callbacks(callbacks);
        }
        network.attach_canceller(controller.bootstrap_canceller());
        let events = controller.subscribe();
        Self {
            network,
            controller: Arc::new(controller),
            events,
        }
    }

    /// Put `node` in radio range and register it as an existing mesh member.
    pub fn register(&self, node: SimNode) {
        let info = node.node_info();
        let mut device = Device::from_node_info(
            info.node_id,
            info.device_class,
            info.supported,
            info.controlled,
        );
        device.is_listening = info.is_listening;
        device.status = if info.is_listening {
            NodeStatus::Alive
        } else {
            NodeStatus::Asleep
        };
        self.network.add_node(node);
        self.controller
            .add_node(device)
            .expect("node id already registered");
    }

    /// Report `node` joining the open inclusion, as the firmware would.
    pub async fn join(&self, node: &SimNode) {
        self.notify(ControllerNotification::AddNode(AddNodeReport {
            status: AddNodeStatus::AddingSlave,
            node_info: Some(node.node_info()),
        }))
        .await;
        self.notify(ControllerNotification::AddNode(AddNodeReport {
            status: AddNodeStatus::ProtocolDone,
            node_info: None,
        }))
        .await;
    }

    pub async fn notify(&self, notification: ControllerNotification) {
        self.controller
            .handle_notification(notification)
            .await
            .expect("notification rejected");
    }

    /// Events emitted since the last drain.
    pub fn drain_events(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Result of the last `NodeAdded` event for `node_id`.
    pub fn added(&mut self, node_id: u16) -> Option<InclusionResult> {
        self.drain_events()
            .into_iter()
            .filter_map(|event| match event {
                ControllerEvent::NodeAdded { node_id: id, result } if id == node_id => Some(result),
                _ => None,
            })
            .last()
    }

    /// Security classes granted to `node_id`, highest first.
    pub fn granted(&self, node_id: u16) -> Vec<SecurityClass> {
        let device = self.controller.node(node_id).expect("node not registered");
        SecurityClass::GRANTABLE
            .iter()
            .copied()
            .filter(|class| device.has_security_class(*class))
            .collect()
    }
}
