//! Inclusion, exclusion and replacement of mesh members.
//!
//! The network is opened with an add/remove request; everything after that is
//! driven by the status reports the controller firmware pushes through
//! [`Controller::handle_notification`].

use crate::bootstrap::s2::GrantPolicy;
use crate::controller::Controller;
use crate::error::{ControllerError, ControllerResult, ReplaceRejectReason, SecurityBootstrapFailure};
use crate::events::{ControllerEvent, InclusionResult};
use crate::provisioning::{ProvisioningKey, ProvisioningStatus};
use crate::state::{
    InclusionOptions, InclusionState, InclusionStrategy, Joining, Phase, ReplaceOptions,
    ReplaceStrategy,
};
use crate::transport::{
    AddNodeMode, AddNodeReport, AddNodeStatus, NodeInfo, RemoveNodeMode, RemoveNodeReport,
    RemoveNodeStatus, ReplaceNodeStatus, Request, Response,
};
use homemesh_core::{CommandClass, Device, ExclusionStrategy, NodeId, NodeStatus, SecurityClass};
use tracing::{debug, info, warn};

/// Build a device record from announced node information.
fn device_from_info(info: &NodeInfo) -> Device {
    let mut device = Device::from_node_info(
        info.node_id,
        info.device_class,
        info.supported.iter().copied(),
        info.controlled.iter().copied(),
    );
    device.is_listening = info.is_listening;
    device.is_frequent_listening = info.is_frequent_listening;
    device.status = if device.can_sleep() {
        NodeStatus::Awake
    } else {
        NodeStatus::Alive
    };
    device
}

/// What a terminal join report found in the phase.
enum JoinOutcome {
    Completed(InclusionOptions, Device),
    NothingJoined,
    NotIncluding,
}

impl Controller {
    // ------------------------------------------------------------------
    // Inclusion
    // ------------------------------------------------------------------

    /// Open the network for a new node.
    ///
    /// Returns `Ok(false)` without any radio traffic if another operation is
    /// active.
    pub async fn begin_inclusion(&self, options: InclusionOptions) -> ControllerResult<bool> {
        let state = self.inclusion_state();
        if !state.is_available() {
            debug!(state = %state, "Inclusion not started, controller is busy");
            return Ok(false);
        }
        if self.is_healing_active() {
            debug!("Inclusion not started, healing runs");
            return Ok(false);
        }
        self.pause_smart_start().await;

        let secure = options.strategy.is_secure();
        let joining = Phase::Including(Joining::New {
            options,
            pending: None,
        });
        if !self.claim_idle(joining) {
            return Ok(false);
        }
        self.open_for_joining(AddNodeMode::Any, secure).await
    }

    async fn open_for_joining(&self, mode: AddNodeMode, secure: bool) -> ControllerResult<bool> {
        match self.transport.send(self.add_node_request(mode)).await {
            Ok(Response::AddNode(AddNodeStatus::Failed)) => {
                self.return_to_idle().await;
                Err(ControllerError::InclusionFailed(
                    "controller reported a failure".to_string(),
                ))
            }
            Ok(_) => {
                info!(secure, "Inclusion started");
                self.emit(ControllerEvent::InclusionStarted { secure });
                Ok(true)
            }
            Err(e) => {
                self.return_to_idle().await;
                Err(ControllerError::InclusionFailed(e.to_string()))
            }
        }
    }

    /// Close the network again. Returns `Ok(false)` if not including.
    pub async fn stop_inclusion(&self) -> ControllerResult<bool> {
        if self.inclusion_state() != InclusionState::Including {
            return Ok(false);
        }
        self.send_add_node_stop().await;
        if !self.transition_if(|phase| matches!(phase, Phase::Including(_)), Phase::Idle) {
            return Ok(false);
        }
        info!("Inclusion stopped");
        self.emit(ControllerEvent::InclusionStopped);
        self.auto_enable_smart_start().await;
        Ok(true)
    }

    async fn send_add_node_stop(&self) {
        if let Err(e) = self
            .transport
            .send(self.add_node_request(AddNodeMode::Stop))
            .await
        {
            warn!(error = %e, "Failed to close the network");
        }
    }

    pub(crate) async fn handle_add_node_report(&self, report: AddNodeReport) -> ControllerResult<()> {
        match report.status {
            AddNodeStatus::Ready | AddNodeStatus::NodeFound => {
                debug!(status = ?report.status, "Join in progress");
                Ok(())
            }
            AddNodeStatus::AddingSlave | AddNodeStatus::AddingController => {
                match report.node_info {
                    Some(info) => self.record_pending_join(&info),
                    None => warn!("Join report without node information ignored"),
                }
                Ok(())
            }
            AddNodeStatus::ProtocolDone => {
                if self.inclusion_state() == InclusionState::Including {
                    self.send_add_node_stop().await;
                }
                self.finish_join().await
            }
            AddNodeStatus::Done => self.finish_join().await,
            AddNodeStatus::Failed => {
                if self.inclusion_state() != InclusionState::Including {
                    return Ok(());
                }
                warn!("Inclusion failed");
                self.send_add_node_stop().await;
                self.emit(ControllerEvent::InclusionFailed);
                self.return_to_idle().await;
                Ok(())
            }
        }
    }

    fn record_pending_join(&self, info: &NodeInfo) {
        let device = device_from_info(info);
        let recorded = self.update_phase(|phase| match phase {
            Phase::Including(Joining::New { pending, .. }) => {
                *pending = Some(device.clone());
                true
            }
            _ => false,
        });
        if !recorded {
            debug!(node_id = info.node_id, "Join report outside of inclusion ignored");
            return;
        }
        info!(node_id = info.node_id, "Node found");
        self.emit(ControllerEvent::NodeFound {
            node_id: device.id,
            device_class: device.device_class,
            supported: device.supported().collect(),
        });
    }

    async fn finish_join(&self) -> ControllerResult<()> {
        let outcome = self.update_phase(|phase| match std::mem::take(phase) {
            Phase::Including(Joining::New {
                options,
                pending: Some(device),
            }) => {
                *phase = Phase::Busy {
                    node_id: device.id,
                    session: None,
                };
                JoinOutcome::Completed(options, device)
            }
            Phase::Including(Joining::New { pending: None, .. }) => JoinOutcome::NothingJoined,
            other => {
                *phase = other;
                JoinOutcome::NotIncluding
            }
        });

        match outcome {
            JoinOutcome::Completed(options, device) => self.complete_inclusion(options, device).await,
            JoinOutcome::NothingJoined => {
                debug!("Inclusion finished without a node");
                self.emit(ControllerEvent::InclusionStopped);
                self.auto_enable_smart_start().await;
                Ok(())
            }
            JoinOutcome::NotIncluding => Ok(()),
        }
    }

    async fn complete_inclusion(&self, options: InclusionOptions, device: Device) -> ControllerResult<()> {
        let node_id = device.id;
        if let Err(e) = self.with_registry_mut(|registry| registry.insert(device)) {
            self.return_to_idle().await;
            return Err(e.into());
        }

        if let InclusionStrategy::SecurityS2 {
            provisioning: Some(entry),
        } = &options.strategy
        {
            self.with_provisioning_mut(|list| {
                if let Some(stored) = list.get_mut(&ProvisioningKey::Dsk(entry.dsk.clone())) {
                    stored.node_id = Some(node_id);
                }
            });
        }

        let result = self.bootstrap_security(node_id, &options).await;
        let lifeline = self.bootstrap_lifeline(node_id).await;

        self.return_to_idle().await;
        info!(
            node_id,
            low_security = result.low_security,
            reason = ?result.low_security_reason,
            "Node added"
        );
        self.emit(ControllerEvent::NodeAdded { node_id, result });
        lifeline
    }

    /// Pick and run the handshake for a freshly joined node.
    async fn bootstrap_security(&self, node_id: NodeId, options: &InclusionOptions) -> InclusionResult {
        let (supports_s2, supports_s0, mandates_security) = self
            .with_registry(|registry| {
                registry.get(node_id).map(|device| {
                    (
                        device.supports(CommandClass::Security2),
                        device.supports(CommandClass::Security),
                        device
                            .device_class
                            .map(|class| class.requires_security())
                            .unwrap_or(false),
                    )
                })
            })
            .unwrap_or_default();
        let callbacks = options
            .user_callbacks
            .clone()
            .or_else(|| self.user_callbacks());

        match &options.strategy {
            InclusionStrategy::Insecure => {
                self.mark_insecure(node_id);
                InclusionResult::default()
            }
            InclusionStrategy::SecurityS0 => {
                self.update_device(node_id, |device| device.add_supported(CommandClass::Security));
                InclusionResult::from_failure(self.secure_bootstrap_s0(node_id).await)
            }
            InclusionStrategy::SecurityS2 { provisioning } => {
                self.update_device(node_id, |device| device.add_supported(CommandClass::Security2));
                let policy = match provisioning {
                    Some(entry) => GrantPolicy::Provisioned(entry.clone()),
                    None => GrantPolicy::User(callbacks),
                };
                self.s2_inclusion_result(node_id, policy).await
            }
            InclusionStrategy::Default if supports_s2 => {
                self.s2_inclusion_result(node_id, GrantPolicy::User(callbacks))
                    .await
            }
            InclusionStrategy::Default if supports_s0 && mandates_security => {
                InclusionResult::from_failure(self.secure_bootstrap_s0(node_id).await)
            }
            InclusionStrategy::Default => {
                self.mark_insecure(node_id);
                InclusionResult::default()
            }
        }
    }

    async fn s2_inclusion_result(&self, node_id: NodeId, policy: GrantPolicy) -> InclusionResult {
        let failure = match self.secure_bootstrap_s2(node_id, policy).await {
            Some(failure) => Some(failure),
            None => {
                let highest = self
                    .node(node_id)
                    .and_then(|device| device.highest_security_class());
                // granted nothing better than the legacy key
                match highest {
                    Some(class) if class >= SecurityClass::S2Unauthenticated => None,
                    _ => Some(SecurityBootstrapFailure::Unknown),
                }
            }
        };
        InclusionResult::from_failure(failure)
    }

    fn mark_insecure(&self, node_id: NodeId) {
        self.update_device(node_id, |device| device.revoke_all_security_classes());
    }

    // ------------------------------------------------------------------
    // SmartStart joins
    // ------------------------------------------------------------------

    pub(crate) async fn handle_smart_start_request(
        &self,
        nwi_home_id: [u8; 4],
        node_info: Option<NodeInfo>,
    ) -> ControllerResult<()> {
        let state = self.inclusion_state();
        if !state.is_available() {
            debug!(state = %state, "SmartStart request ignored, controller is busy");
            return Ok(());
        }
        if self.is_healing_active() {
            debug!("SmartStart request ignored, healing runs");
            return Ok(());
        }
        let Some(entry) = self
            .read_provisioning()
            .find_active_by_nwi_home_id(nwi_home_id)
            .cloned()
        else {
            debug!(nwi_home_id = %hex::encode(nwi_home_id), "SmartStart request from unknown node ignored");
            return Ok(());
        };
        info!(dsk = %entry.dsk, "SmartStart node requests inclusion");
        if let Some(info) = &node_info {
            debug!(node_id = info.node_id, "SmartStart request carries node information");
        }

        self.pause_smart_start().await;
        let joining = Phase::Including(Joining::New {
            options: InclusionOptions::new(InclusionStrategy::SecurityS2 {
                provisioning: Some(entry),
            }),
            pending: None,
        });
        if !self.claim_idle(joining) {
            return Ok(());
        }
        self.open_for_joining(AddNodeMode::SmartStartInclude { nwi_home_id }, true)
            .await
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Exclusion
    // ------------------------------------------------------------------

    /// Start exclusion. `strategy` overrides the configured one.
    pub async fn begin_exclusion(&self, strategy: Option<ExclusionStrategy>) -> ControllerResult<bool> {
        let state = self.inclusion_state();
        if !state.is_available() {
            debug!(state = %state, "Exclusion not started, controller is busy");
            return Ok(false);
        }
        if self.is_healing_active() {
            debug!("Exclusion not started, healing runs");
            return Ok(false);
        }
        self.pause_smart_start().await;

        let excluding = Phase::Excluding {
            strategy: strategy.unwrap_or(self.config.exclusion.strategy),
            node_id: None,
        };
        if !self.claim_idle(excluding) {
            return Ok(false);
        }

        match self.transport.send(self.remove_node_request(RemoveNodeMode::Any)).await {
            Ok(Response::RemoveNode(RemoveNodeStatus::Failed)) => {
                self.return_to_idle().await;
                Err(ControllerError::ExclusionFailed(
                    "controller reported a failure".to_string(),
                ))
            }
            Ok(_) => {
                info!("Exclusion started");
                self.emit(ControllerEvent::ExclusionStarted);
                Ok(true)
            }
            Err(e) => {
                self.return_to_idle().await;
                Err(ControllerError::ExclusionFailed(e.to_string()))
            }
        }
    }

    /// Stop exclusion. Returns `Ok(false)` if not excluding.
    pub async fn stop_exclusion(&self) -> ControllerResult<bool> {
        if self.inclusion_state() != InclusionState::Excluding {
            return Ok(false);
        }
        self.send_remove_node_stop().await;
        if !self.transition_if(|phase| matches!(phase, Phase::Excluding { .. }), Phase::Idle) {
            return Ok(false);
        }
        info!("Exclusion stopped");
        self.emit(ControllerEvent::ExclusionStopped);
        self.auto_enable_smart_start().await;
        Ok(true)
    }

    fn remove_node_request(&self, mode: RemoveNodeMode) -> Request {
        Request::RemoveNode {
            mode,
            high_power: self.config.controller.high_power,
            network_wide: self.config.controller.network_wide,
        }
    }

    async fn send_remove_node_stop(&self) {
        if let Err(e) = self
            .transport
            .send(self.remove_node_request(RemoveNodeMode::Stop))
            .await
        {
            warn!(error = %e, "Failed to stop exclusion");
        }
    }

    pub(crate) async fn handle_remove_node_report(&self, report: RemoveNodeReport) -> ControllerResult<()> {
        match report.status {
            RemoveNodeStatus::Ready | RemoveNodeStatus::NodeFound => {
                debug!(status = ?report.status, "Exclusion in progress");
                Ok(())
            }
            RemoveNodeStatus::RemovingSlave | RemoveNodeStatus::RemovingController => {
                self.update_phase(|phase| {
                    if let Phase::Excluding { node_id, .. } = phase {
                        *node_id = report.node_id;
                    }
                });
                Ok(())
            }
            RemoveNodeStatus::Done => {
                let mut finished = None;
                self.update_phase(|phase| {
                    if let Phase::Excluding { strategy, node_id } = *phase {
                        let target = node_id.or(report.node_id);
                        finished = Some((strategy, target));
                        *phase = Phase::Busy {
                            node_id: target.unwrap_or_default(),
                            session: None,
                        };
                    }
                });
                let Some((strategy, node_id)) = finished else {
                    return Ok(());
                };
                self.send_remove_node_stop().await;
                if let Some(node_id) = node_id {
                    self.complete_exclusion(node_id, strategy);
                }
                self.return_to_idle().await;
                Ok(())
            }
            RemoveNodeStatus::Failed => {
                if self.inclusion_state() != InclusionState::Excluding {
                    return Ok(());
                }
                warn!("Exclusion failed");
                self.send_remove_node_stop().await;
                self.emit(ControllerEvent::ExclusionFailed);
                self.return_to_idle().await;
                Ok(())
            }
        }
    }

    fn complete_exclusion(&self, node_id: NodeId, strategy: ExclusionStrategy) {
        self.with_registry_mut(|registry| registry.remove(node_id));
        self.keys.clear_temporary_key(node_id);

        let key = ProvisioningKey::NodeId(node_id);
        self.with_provisioning_mut(|list| match strategy {
            ExclusionStrategy::ExcludeOnly => {}
            ExclusionStrategy::DisableProvisioningEntry => {
                if let Some(entry) = list.get_mut(&key) {
                    entry.status = ProvisioningStatus::Inactive;
                    entry.node_id = None;
                }
            }
            ExclusionStrategy::Unprovision => {
                list.remove(&key);
            }
        });

        info!(node_id, strategy = ?strategy, "Node removed");
        self.emit(ControllerEvent::NodeRemoved {
            node_id,
            replaced: false,
        });
    }

    // ------------------------------------------------------------------
    // Replacement
    // ------------------------------------------------------------------

    /// Replace a failed node with a new device under the same id.
    ///
    /// The node must fail a ping first and be known to the controller firmware
    /// as failed. Returns `Ok(false)` if another operation is active.
    pub async fn replace_failed_node(&self, node_id: NodeId, options: ReplaceOptions) -> ControllerResult<bool> {
        let state = self.inclusion_state();
        if !state.is_available() {
            debug!(state = %state, "Replace not started, controller is busy");
            return Ok(false);
        }
        if self.is_healing_active() {
            debug!("Replace not started, healing runs");
            return Ok(false);
        }
        self.with_registry(|registry| registry.get_or_fail(node_id).map(|_| ()))?;

        if self.ping(node_id).await? {
            return Err(ControllerError::NodeStillAlive { node_id });
        }
        match self.transport.send(Request::IsFailedNode { node_id }).await? {
            Response::FailedNode(true) => {}
            Response::FailedNode(false) => return Err(ControllerError::NodeNotFailed { node_id }),
            _ => {
                return Err(crate::error::TransportError::UnexpectedResponse {
                    request: "IsFailedNode",
                }
                .into())
            }
        }

        self.pause_smart_start().await;
        if !self.claim_idle(Phase::Replacing { node_id, options }) {
            return Ok(false);
        }

        let flags = match self.transport.send(Request::ReplaceFailedNode { node_id }).await {
            Ok(Response::ReplaceStarted { flags }) => flags,
            Ok(_) => {
                self.return_to_idle().await;
                return Err(crate::error::TransportError::UnexpectedResponse {
                    request: "ReplaceFailedNode",
                }
                .into());
            }
            Err(e) => {
                self.return_to_idle().await;
                return Err(e.into());
            }
        };
        if let Some(reason) = ReplaceRejectReason::from_flags(flags) {
            warn!(node_id, reason = %reason, "Replacing failed node was rejected");
            self.return_to_idle().await;
            return Err(ControllerError::ReplaceFailed(reason));
        }
        info!(node_id, "Replacing failed node");
        Ok(true)
    }

    pub(crate) async fn handle_replace_status(
        &self,
        node_id: NodeId,
        status: ReplaceNodeStatus,
    ) -> ControllerResult<()> {
        match status {
            ReplaceNodeStatus::NodeOk => {
                if !self.is_replacing(node_id) {
                    return Ok(());
                }
                warn!(node_id, "Node responded, replace aborted");
                self.emit(ControllerEvent::InclusionFailed);
                self.return_to_idle().await;
                Ok(())
            }
            ReplaceNodeStatus::FailedNodeReplace => {
                let mut secure = None;
                self.update_phase(|phase| match std::mem::take(phase) {
                    Phase::Replacing {
                        node_id: target,
                        options,
                    } if target == node_id => {
                        secure = Some(options.strategy != ReplaceStrategy::Insecure);
                        *phase = Phase::Including(Joining::Replacement { node_id, options });
                    }
                    other => *phase = other,
                });
                if let Some(secure) = secure {
                    info!(node_id, "Waiting for the replacement node");
                    self.emit(ControllerEvent::InclusionStarted { secure });
                }
                Ok(())
            }
            ReplaceNodeStatus::FailedNodeReplaceDone => {
                let mut taken = None;
                self.update_phase(|phase| match std::mem::take(phase) {
                    Phase::Including(Joining::Replacement {
                        node_id: target,
                        options,
                    })
                    | Phase::Replacing {
                        node_id: target,
                        options,
                    } if target == node_id => {
                        taken = Some(options);
                        *phase = Phase::Busy {
                            node_id,
                            session: None,
                        };
                    }
                    other => *phase = other,
                });
                match taken {
                    Some(options) => self.complete_replacement(node_id, options).await,
                    None => Ok(()),
                }
            }
            ReplaceNodeStatus::FailedNodeReplaceFailed => {
                if !self.is_replacing(node_id) {
                    return Ok(());
                }
                warn!(node_id, "Replacing failed node failed");
                self.emit(ControllerEvent::InclusionFailed);
                self.return_to_idle().await;
                Ok(())
            }
        }
    }

    fn is_replacing(&self, node_id: NodeId) -> bool {
        self.update_phase(|phase| {
            matches!(
                phase,
                Phase::Replacing { node_id: target, .. }
                    | Phase::Including(Joining::Replacement { node_id: target, .. })
                    if *target == node_id
            )
        })
    }

    async fn complete_replacement(&self, node_id: NodeId, options: ReplaceOptions) -> ControllerResult<()> {
        self.with_registry_mut(|registry| registry.remove(node_id));
        self.keys.clear_temporary_key(node_id);
        self.emit(ControllerEvent::NodeRemoved {
            node_id,
            replaced: true,
        });

        let device = Device::placeholder(node_id);
        if let Err(e) = self.with_registry_mut(|registry| registry.insert(device)) {
            self.return_to_idle().await;
            return Err(e.into());
        }
        self.emit(ControllerEvent::NodeFound {
            node_id,
            device_class: None,
            supported: Vec::new(),
        });

        let callbacks = options
            .user_callbacks
            .clone()
            .or_else(|| self.user_callbacks());
        let result = match options.strategy {
            ReplaceStrategy::Insecure => {
                self.mark_insecure(node_id);
                InclusionResult::default()
            }
            ReplaceStrategy::SecurityS0 => {
                self.update_device(node_id, |device| device.add_supported(CommandClass::Security));
                InclusionResult::from_failure(self.secure_bootstrap_s0(node_id).await)
            }
            ReplaceStrategy::SecurityS2 => {
                self.update_device(node_id, |device| device.add_supported(CommandClass::Security2));
                self.s2_inclusion_result(node_id, GrantPolicy::User(callbacks))
                    .await
            }
        };
        let lifeline = self.bootstrap_lifeline(node_id).await;

        self.return_to_idle().await;
        info!(node_id, low_security = result.low_security, "Replacement node added");
        self.emit(ControllerEvent::NodeAdded { node_id, result });
        lifeline
    }
}
