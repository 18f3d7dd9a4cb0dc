//! The controller core.
//!
//! [`Controller`] owns the device registry, the inclusion state machine, the
//! provisioning list and the healing state. All radio traffic goes through the
//! [`Transport`]; network keys come from the [`KeyStore`].
//!
//! Locks are never held across an `.await`. Mutual exclusion between long
//! operations comes from the inclusion [`Phase`] and the healing flag, not
//! from the locks.

use crate::bootstrap::cancel::CancelSender;
use crate::callbacks::InclusionUserCallbacks;
use crate::command::{Command, Encapsulation, KexFailType};
use crate::error::{ControllerError, ControllerResult, TransportError};
use crate::events::{ControllerEvent, EventBus};
use crate::healing::HealingState;
use crate::provisioning::{ProvisioningEntry, ProvisioningKey, ProvisioningList};
use crate::state::{InclusionState, Phase, SessionHandle};
use crate::transport::{AddNodeMode, ControllerNotification, Request, Response, Transport};
use homemesh_core::{ControllerConfig, Device, NodeId, NodeRegistry, NodeStatus};
use homemesh_crypto::KeyStore;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Network management core of one controller.
pub struct Controller {
    pub(crate) config: ControllerConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) keys: Arc<dyn KeyStore>,
    registry: RwLock<NodeRegistry>,
    phase: Arc<Mutex<Phase>>,
    provisioning: RwLock<ProvisioningList>,
    events: EventBus,
    user_callbacks: Option<Arc<dyn InclusionUserCallbacks>>,
    pub(crate) healing: HealingState,
}

impl Controller {
    /// Create a controller. The registry starts with the controller's own node.
    pub fn new(
        config: ControllerConfig,
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyStore>,
    ) -> Self {
        let mut registry = NodeRegistry::new();
        let own = Device::placeholder(config.controller.own_node_id);
        if let Err(e) = registry.insert(own) {
            warn!(error = %e, "Controller node id is not a valid node id");
        }

        Self {
            config,
            transport,
            keys,
            registry: RwLock::new(registry),
            phase: Arc::new(Mutex::new(Phase::Idle)),
            provisioning: RwLock::new(ProvisioningList::new()),
            events: EventBus::new(),
            user_callbacks: None,
            healing: HealingState::new(),
        }
    }

    /// Controller-wide callbacks for grant and PIN prompts.
    pub fn with_user_callbacks(mut self, callbacks: Arc<dyn InclusionUserCallbacks>) -> Self {
        self.user_callbacks = Some(callbacks);
        self
    }

    pub fn own_node_id(&self) -> NodeId {
        self.config.controller.own_node_id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn inclusion_state(&self) -> InclusionState {
        self.lock_phase().state()
    }

    // ------------------------------------------------------------------
    // Registry access
    // ------------------------------------------------------------------

    /// Snapshot of one device.
    pub fn node(&self, node_id: NodeId) -> Option<Device> {
        self.read_registry().get(node_id).cloned()
    }

    /// Ids of all known devices, including the controller.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.read_registry().ids()
    }

    /// Add or replace a device record, e.g. when restoring from a cache.
    pub fn add_node(&self, device: Device) -> ControllerResult<()> {
        self.write_registry().insert(device)?;
        Ok(())
    }

    pub(crate) fn with_registry<R>(&self, f: impl FnOnce(&NodeRegistry) -> R) -> R {
        f(&self.read_registry())
    }

    pub(crate) fn with_registry_mut<R>(&self, f: impl FnOnce(&mut NodeRegistry) -> R) -> R {
        f(&mut self.write_registry())
    }

    /// Apply `f` to a device. Returns `false` if the device is unknown.
    pub(crate) fn update_device(&self, node_id: NodeId, f: impl FnOnce(&mut Device)) -> bool {
        match self.write_registry().get_mut(node_id) {
            Some(device) => {
                f(device);
                true
            }
            None => false,
        }
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, NodeRegistry> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, NodeRegistry> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        lock_phase(&self.phase)
    }

    /// Run `f` on the phase and announce a state change if there was one.
    pub(crate) fn update_phase<R>(&self, f: impl FnOnce(&mut Phase) -> R) -> R {
        let (before, after, result) = {
            let mut phase = self.lock_phase();
            let before = phase.state();
            let result = f(&mut phase);
            (before, phase.state(), result)
        };
        if before != after {
            debug!(from = %before, to = %after, "Inclusion state changed");
            self.events.emit(ControllerEvent::InclusionStateChanged(after));
        }
        result
    }

    /// Move to `next` if the current phase satisfies `allowed`.
    pub(crate) fn transition_if(&self, allowed: impl FnOnce(&Phase) -> bool, next: Phase) -> bool {
        self.update_phase(|phase| {
            if !allowed(phase) {
                return false;
            }
            *phase = next;
            true
        })
    }

    /// Leave idle for `next` unless a heal runs. A heal raises its flag
    /// before it reads the phase, so under the phase lock one side always
    /// sees the other.
    pub(crate) fn claim_idle(&self, next: Phase) -> bool {
        self.transition_if(
            |phase| matches!(phase, Phase::Idle) && !self.is_healing_active(),
            next,
        )
    }

    /// Go back to idle and re-arm SmartStart if there is work for it.
    pub(crate) async fn return_to_idle(&self) {
        self.update_phase(|phase| *phase = Phase::Idle);
        self.auto_enable_smart_start().await;
    }

    pub(crate) fn emit(&self, event: ControllerEvent) {
        self.events.emit(event);
    }

    pub(crate) fn user_callbacks(&self) -> Option<Arc<dyn InclusionUserCallbacks>> {
        self.user_callbacks.clone()
    }

    pub(crate) fn attach_session(&self, node_id: NodeId, cancel: CancelSender) {
        self.update_phase(|phase| match phase {
            Phase::Busy {
                node_id: busy_node,
                session,
            } if *busy_node == node_id => {
                *session = Some(SessionHandle { node_id, cancel });
            }
            _ => debug!(node_id, "Bootstrap session runs outside of a busy phase"),
        });
    }

    pub(crate) fn detach_session(&self, node_id: NodeId) {
        self.update_phase(|phase| {
            if let Phase::Busy { session, .. } = phase {
                if session.as_ref().map(|s| s.node_id) == Some(node_id) {
                    *session = None;
                }
            }
        });
    }

    /// Handle that aborts the running modern bootstrap from anywhere.
    pub fn bootstrap_canceller(&self) -> BootstrapCanceller {
        BootstrapCanceller {
            phase: Arc::clone(&self.phase),
        }
    }

    /// Abort the running modern bootstrap. Returns `false` if none runs.
    pub fn cancel_secure_bootstrap_s2(&self, reason: KexFailType) -> bool {
        self.bootstrap_canceller().cancel(reason)
    }

    // ------------------------------------------------------------------
    // SmartStart
    // ------------------------------------------------------------------

    /// Start listening for SmartStart join requests.
    ///
    /// Returns `Ok(false)` when another operation is active or no provisioning
    /// entry is waiting for its device.
    pub async fn enable_smart_start(&self) -> ControllerResult<bool> {
        if !self.config.controller.supports_smart_start {
            return Err(ControllerError::SmartStartUnsupported);
        }
        if !self.read_provisioning().has_pending() {
            return Ok(false);
        }
        if !self.transition_if(|phase| matches!(phase, Phase::Idle), Phase::SmartStart) {
            return Ok(self.inclusion_state() == InclusionState::SmartStart);
        }

        if let Err(e) = self
            .transport
            .send(self.add_node_request(AddNodeMode::SmartStartListen))
            .await
        {
            // no re-arm here, that would just retry the failing request
            self.update_phase(|phase| *phase = Phase::Idle);
            return Err(e.into());
        }
        info!("SmartStart listening enabled");
        Ok(true)
    }

    /// Stop listening for SmartStart join requests.
    pub async fn disable_smart_start(&self) -> ControllerResult<bool> {
        if !self.transition_if(|phase| matches!(phase, Phase::SmartStart), Phase::Idle) {
            return Ok(false);
        }
        self.transport
            .send(self.add_node_request(AddNodeMode::Stop))
            .await?;
        info!("SmartStart listening disabled");
        Ok(true)
    }

    /// Leave SmartStart listening before another operation takes over.
    pub(crate) async fn pause_smart_start(&self) {
        if !self.transition_if(|phase| matches!(phase, Phase::SmartStart), Phase::Idle) {
            return;
        }
        if let Err(e) = self
            .transport
            .send(self.add_node_request(AddNodeMode::Stop))
            .await
        {
            warn!(error = %e, "Failed to pause SmartStart listening");
        }
    }

    pub(crate) async fn auto_enable_smart_start(&self) {
        if !self.config.controller.supports_smart_start {
            return;
        }
        if let Err(e) = self.enable_smart_start().await {
            warn!(error = %e, "Failed to re-arm SmartStart listening");
        }
    }

    pub(crate) fn add_node_request(&self, mode: AddNodeMode) -> Request {
        Request::AddNode {
            mode,
            high_power: self.config.controller.high_power,
            network_wide: self.config.controller.network_wide,
        }
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    /// Add or update a SmartStart provisioning entry.
    pub async fn provision_smart_start_node(&self, entry: ProvisioningEntry) -> ControllerResult<()> {
        self.write_provisioning().upsert(entry)?;
        if self.inclusion_state() == InclusionState::Idle {
            self.auto_enable_smart_start().await;
        }
        Ok(())
    }

    /// Remove a provisioning entry by DSK or node id.
    pub async fn unprovision_smart_start_node(
        &self,
        key: impl Into<ProvisioningKey>,
    ) -> ControllerResult<bool> {
        let key = key.into();
        let (removed, pending) = {
            let mut list = self.write_provisioning();
            (list.remove(&key).is_some(), list.has_pending())
        };
        if removed && !pending {
            self.disable_smart_start().await?;
        }
        Ok(removed)
    }

    pub fn get_provisioning_entry(&self, key: impl Into<ProvisioningKey>) -> Option<ProvisioningEntry> {
        self.read_provisioning().get(&key.into()).cloned()
    }

    pub fn provisioning_entries(&self) -> Vec<ProvisioningEntry> {
        self.read_provisioning().entries().to_vec()
    }

    /// Snapshot of the whole list, for persisting.
    pub fn provisioning_list(&self) -> ProvisioningList {
        self.read_provisioning().clone()
    }

    /// Replace the whole list, e.g. after loading it from disk.
    pub fn restore_provisioning_list(&self, list: ProvisioningList) {
        *self.write_provisioning() = list;
    }

    pub(crate) fn with_provisioning_mut<R>(&self, f: impl FnOnce(&mut ProvisioningList) -> R) -> R {
        f(&mut self.write_provisioning())
    }

    pub(crate) fn read_provisioning(&self) -> RwLockReadGuard<'_, ProvisioningList> {
        self.provisioning
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_provisioning(&self) -> RwLockWriteGuard<'_, ProvisioningList> {
        self.provisioning
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Device traffic
    // ------------------------------------------------------------------

    /// Send a command to a device and wait for the acknowledgment.
    pub(crate) async fn send_command(
        &self,
        node_id: NodeId,
        command: Command,
        encapsulation: Encapsulation,
    ) -> Result<(), TransportError> {
        debug!(node_id, command = command.name(), "Sending command");
        let response = self
            .transport
            .send(Request::SendData {
                node_id,
                command,
                encapsulation,
            })
            .await?;
        match response {
            Response::Ack => Ok(()),
            _ => Err(TransportError::UnexpectedResponse {
                request: "SendData",
            }),
        }
    }

    /// Probe a device with a no-op and record the outcome as its status.
    pub async fn ping(&self, node_id: NodeId) -> ControllerResult<bool> {
        let can_sleep = self.with_registry(|registry| {
            registry
                .get_or_fail(node_id)
                .map(|device| device.can_sleep())
        })?;

        match self
            .send_command(node_id, Command::NoOperation, Encapsulation::None)
            .await
        {
            Ok(()) => {
                let status = if can_sleep {
                    NodeStatus::Awake
                } else {
                    NodeStatus::Alive
                };
                self.update_device(node_id, |device| device.status = status);
                Ok(true)
            }
            Err(e) if e.is_transmission_error() => {
                debug!(node_id, error = %e, "Ping failed");
                let status = if can_sleep {
                    NodeStatus::Asleep
                } else {
                    NodeStatus::Dead
                };
                self.update_device(node_id, |device| device.status = status);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Process one notification pushed by the controller firmware.
    pub async fn handle_notification(
        &self,
        notification: ControllerNotification,
    ) -> ControllerResult<()> {
        match notification {
            ControllerNotification::AddNode(report) => self.handle_add_node_report(report).await,
            ControllerNotification::RemoveNode(report) => {
                self.handle_remove_node_report(report).await
            }
            ControllerNotification::ReplaceFailedNode { node_id, status } => {
                self.handle_replace_status(node_id, status).await
            }
            ControllerNotification::SmartStartRequest {
                nwi_home_id,
                node_info,
            } => {
                self.handle_smart_start_request(nwi_home_id, node_info)
                    .await
            }
            ControllerNotification::NodeStatus { node_id, status } => {
                if !self.update_device(node_id, |device| device.status = status) {
                    debug!(node_id, "Status for unknown node ignored");
                }
                Ok(())
            }
        }
    }

    /// Process notifications in order until the channel closes.
    pub async fn pump_notifications(&self, mut notifications: mpsc::Receiver<ControllerNotification>) {
        while let Some(notification) = notifications.recv().await {
            if let Err(e) = self.handle_notification(notification).await {
                error!(error = %e, "Failed to handle controller notification");
            }
        }
        debug!("Notification channel closed");
    }
}

fn lock_phase(phase: &Mutex<Phase>) -> MutexGuard<'_, Phase> {
    phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable handle that aborts the running modern bootstrap.
///
/// The transport holds one to report traffic that cannot be decrypted with
/// the temporary key; operator interfaces use it to cancel an inclusion.
#[derive(Clone)]
pub struct BootstrapCanceller {
    phase: Arc<Mutex<Phase>>,
}

impl BootstrapCanceller {
    /// Cancel whichever session runs. Returns `false` if none runs.
    pub fn cancel(&self, reason: KexFailType) -> bool {
        match &*lock_phase(&self.phase) {
            Phase::Busy {
                session: Some(session),
                ..
            } => session.cancel.cancel(reason),
            _ => false,
        }
    }

    /// Cancel the session only if it bootstraps `node_id`.
    pub fn cancel_node(&self, node_id: NodeId, reason: KexFailType) -> bool {
        match &*lock_phase(&self.phase) {
            Phase::Busy {
                session: Some(session),
                ..
            } if session.node_id == node_id => session.cancel.cancel(reason),
            _ => false,
        }
    }
}
