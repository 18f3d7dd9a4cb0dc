//! Legacy single-key bootstrap.

use crate::command::{Command, Encapsulation};
use crate::controller::Controller;
use crate::error::{SecurityBootstrapFailure, TransportError};
use crate::transport::from_node;
use homemesh_core::{CommandClass, NodeId, SecurityClass};
use homemesh_crypto::NetworkKey;
use std::time::Duration;
use tracing::{debug, info, warn};

impl Controller {
    /// Hand the legacy network key to a node.
    pub(crate) async fn secure_bootstrap_s0(&self, node_id: NodeId) -> Option<SecurityBootstrapFailure> {
        let Some(key) = self.keys.legacy_key() else {
            warn!(node_id, "No legacy network key configured, node stays insecure");
            self.fail_s0(node_id);
            return Some(SecurityBootstrapFailure::NoKeysConfigured);
        };

        info!(node_id, "Starting legacy security bootstrap");
        let budget = self.config.security.s0_timeout();
        // one budget for the whole exchange, not per reply
        let exchanged = tokio::time::timeout(budget, self.exchange_s0_key(node_id, key, budget))
            .await
            .unwrap_or(Err(TransportError::Timeout));
        match exchanged {
            Ok(()) => {
                self.update_device(node_id, |device| {
                    device.set_granted_exactly(&[SecurityClass::S0Legacy])
                });
                info!(node_id, "Legacy security bootstrap complete");
                None
            }
            Err(e) => {
                self.fail_s0(node_id);
                match e {
                    TransportError::Timeout | TransportError::NodeTimeout { .. } => {
                        warn!(node_id, "Legacy security bootstrap timed out");
                        Some(SecurityBootstrapFailure::Timeout)
                    }
                    e if e.is_transmission_error() => {
                        // peer unreachable, nothing worth reporting loudly
                        debug!(node_id, error = %e, "Legacy security bootstrap message dropped");
                        Some(SecurityBootstrapFailure::Unknown)
                    }
                    e => {
                        warn!(node_id, error = %e, "Legacy security bootstrap failed");
                        Some(SecurityBootstrapFailure::Unknown)
                    }
                }
            }
        }
    }

    async fn exchange_s0_key(
        &self,
        node_id: NodeId,
        key: NetworkKey,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        // the scheme report carries nothing we act on
        self.send_command(node_id, Command::S0SchemeGet, Encapsulation::None)
            .await?;
        self.transport
            .wait_for_command(
                from_node(node_id, |c| matches!(c, Command::S0SchemeReport)),
                timeout,
            )
            .await?;

        self.send_command(node_id, Command::S0NonceGet, Encapsulation::None)
            .await?;
        let nonce = match self
            .transport
            .wait_for_command(
                from_node(node_id, |c| matches!(c, Command::S0NonceReport { .. })),
                timeout,
            )
            .await?
            .command
        {
            Command::S0NonceReport { nonce } => nonce,
            _ => {
                return Err(TransportError::UnexpectedResponse {
                    request: "S0NonceGet",
                })
            }
        };

        self.send_command(
            node_id,
            Command::S0NetworkKeySet { key },
            Encapsulation::S0KeyDelivery {
                receiver_nonce: nonce,
            },
        )
        .await?;
        self.transport
            .wait_for_command(
                from_node(node_id, |c| matches!(c, Command::S0NetworkKeyVerify)),
                timeout,
            )
            .await?;
        Ok(())
    }

    fn fail_s0(&self, node_id: NodeId) {
        self.update_device(node_id, |device| {
            device.set_security_class(SecurityClass::S0Legacy, false);
            device.remove_supported(CommandClass::Security);
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::controller::Controller;
    use crate::error::SecurityBootstrapFailure;
    use crate::testing::{SimNode, SimulatedNetwork};
    use homemesh_core::{CommandClass, ControllerConfig, Device, SecurityClass};
    use homemesh_crypto::{NetworkKey, SecurityManager};
    use std::sync::Arc;

    fn setup(keys: SecurityManager) -> (Arc<SimulatedNetwork>, Controller) {
        let keys = Arc::new(keys);
        let network = Arc::new(SimulatedNetwork::new(keys.clone()));
        let controller = Controller::new(ControllerConfig::default(), network.clone(), keys);
        (network, controller)
    }

    fn secure_device(id: u16) -> Device {
        Device::from_node_info(
            id,
            homemesh_core::DeviceClass::new(0x04, 0x40, 0x03),
            [CommandClass::Security],
            [],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_s0_success() {
        let (network, controller) = setup(
            SecurityManager::new().with_key(SecurityClass::S0Legacy, NetworkKey::generate()),
        );
        network.add_node(SimNode::listening(3).with_s0());
        controller.add_node(secure_device(3)).unwrap();

        assert_eq!(controller.secure_bootstrap_s0(3).await, None);

        let device = controller.node(3).unwrap();
        assert_eq!(device.security_class(SecurityClass::S0Legacy), Some(true));
        assert_eq!(device.security_class(SecurityClass::S2AccessControl), Some(false));
        assert!(network.received_s0_key(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_s0_without_key_sends_nothing() {
        let (network, controller) = setup(SecurityManager::new());
        network.add_node(SimNode::listening(3).with_s0());
        controller.add_node(secure_device(3)).unwrap();

        assert_eq!(
            controller.secure_bootstrap_s0(3).await,
            Some(SecurityBootstrapFailure::NoKeysConfigured)
        );
        assert!(network.requests().is_empty());
        assert!(!controller.node(3).unwrap().supports(CommandClass::Security));
    }

    #[tokio::test(start_paused = true)]
    async fn test_s0_silent_node_times_out() {
        let (network, controller) = setup(
            SecurityManager::new().with_key(SecurityClass::S0Legacy, NetworkKey::generate()),
        );
        // reachable but does not speak the legacy protocol
        network.add_node(SimNode::listening(3));
        controller.add_node(secure_device(3)).unwrap();

        assert_eq!(
            controller.secure_bootstrap_s0(3).await,
            Some(SecurityBootstrapFailure::Timeout)
        );
        let device = controller.node(3).unwrap();
        assert_eq!(device.security_class(SecurityClass::S0Legacy), Some(false));
        assert!(!device.supports(CommandClass::Security));
    }

    #[tokio::test(start_paused = true)]
    async fn test_s0_budget_covers_whole_exchange() {
        let keys = || SecurityManager::new().with_key(SecurityClass::S0Legacy, NetworkKey::generate());

        // three replies of 3 s each fit into the 10 s budget
        let (network, controller) = setup(keys());
        network.add_node(SimNode::listening(3).with_s0().with_delay_ms(3_000));
        controller.add_node(secure_device(3)).unwrap();
        assert_eq!(controller.secure_bootstrap_s0(3).await, None);

        // each 4 s reply fits on its own, all three together do not
        let (network, controller) = setup(keys());
        network.add_node(SimNode::listening(3).with_s0().with_delay_ms(4_000));
        controller.add_node(secure_device(3)).unwrap();
        let started = tokio::time::Instant::now();
        assert_eq!(
            controller.secure_bootstrap_s0(3).await,
            Some(SecurityBootstrapFailure::Timeout)
        );
        assert!(started.elapsed() <= std::time::Duration::from_millis(10_000));
        let device = controller.node(3).unwrap();
        assert_eq!(device.security_class(SecurityClass::S0Legacy), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_s0_unreachable_node() {
        let (network, controller) = setup(
            SecurityManager::new().with_key(SecurityClass::S0Legacy, NetworkKey::generate()),
        );
        network.add_node(SimNode::listening(3).with_s0());
        network.set_reachable(3, false);
        controller.add_node(secure_device(3)).unwrap();

        assert_eq!(
            controller.secure_bootstrap_s0(3).await,
            Some(SecurityBootstrapFailure::Unknown)
        );
    }
}
