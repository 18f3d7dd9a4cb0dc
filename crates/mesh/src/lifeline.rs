//! Lifeline bootstrap run after every successful join.
//!
//! Points association group 1 at the controller, gives the node a return
//! route to it and, for sleeping nodes, makes the controller the wake-up
//! destination. Every step is best-effort.

use crate::command::{Command, Encapsulation};
use crate::controller::Controller;
use crate::error::{ControllerResult, TransportError};
use crate::transport::{from_node, Request, Response};
use homemesh_core::{CommandClass, NodeId};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Association group that reports to the controller.
pub const LIFELINE_GROUP: u8 = 1;

const WAKE_UP_REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Log and swallow recoverable failures, propagate the rest.
fn best_effort<T>(
    node_id: NodeId,
    step: &'static str,
    result: Result<T, TransportError>,
) -> ControllerResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_recoverable() => {
            warn!(node_id, step, error = %e, "Lifeline step failed, continuing");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

impl Controller {
    pub(crate) async fn bootstrap_lifeline(&self, node_id: NodeId) -> ControllerResult<()> {
        let Some(device) = self.node(node_id) else {
            debug!(node_id, "Node vanished before lifeline bootstrap");
            return Ok(());
        };
        let own = self.own_node_id();
        let encapsulation = Encapsulation::for_device(&device);

        let association = if device.supports(CommandClass::MultiChannelAssociation) {
            Some(Command::MultiChannelAssociationSet {
                group: LIFELINE_GROUP,
                node_ids: vec![own],
            })
        } else if device.supports(CommandClass::Association) {
            Some(Command::AssociationSet {
                group: LIFELINE_GROUP,
                node_ids: vec![own],
            })
        } else {
            None
        };

        if let Some(command) = association {
            let sent = self.send_command(node_id, command, encapsulation).await;
            if best_effort(node_id, "lifeline association", sent)?.is_some() {
                self.update_device(node_id, |device| {
                    device.set_association_group(LIFELINE_GROUP, [own])
                });
                let routed = self
                    .transport
                    .send(Request::AssignReturnRoute {
                        node_id,
                        destination: own,
                    })
                    .await;
                if let Some(response) = best_effort(node_id, "lifeline return route", routed)? {
                    if response != Response::RouteAssigned(true) {
                        warn!(node_id, "Return route to the controller was not assigned");
                    }
                }
                info!(node_id, "Lifeline configured");
            }
        }

        if device.can_sleep() && device.supports(CommandClass::WakeUp) {
            self.configure_wake_up(node_id, encapsulation).await?;
        }
        Ok(())
    }

    /// Make the controller the wake-up destination, keeping the node's interval.
    async fn configure_wake_up(&self, node_id: NodeId, encapsulation: Encapsulation) -> ControllerResult<()> {
        let own = self.own_node_id();

        let reported = match self
            .send_command(node_id, Command::WakeUpIntervalGet, encapsulation)
            .await
        {
            Ok(()) => self
                .transport
                .wait_for_command(
                    from_node(node_id, |c| matches!(c, Command::WakeUpIntervalReport { .. })),
                    WAKE_UP_REPORT_TIMEOUT,
                )
                .await
                .map(|inbound| match inbound.command {
                    Command::WakeUpIntervalReport { seconds, .. } => seconds,
                    _ => 0,
                }),
            Err(e) => Err(e),
        };
        let seconds = match best_effort(node_id, "wake-up interval query", reported)? {
            Some(seconds) if seconds > 0 => seconds,
            _ => self.config.lifeline.wake_up_interval,
        };

        let sent = self
            .send_command(
                node_id,
                Command::WakeUpIntervalSet {
                    seconds,
                    node_id: own,
                },
                encapsulation,
            )
            .await;
        if best_effort(node_id, "wake-up destination", sent)?.is_some() {
            debug!(node_id, seconds, "Wake-up destination set");
        }
        Ok(())
    }
}
