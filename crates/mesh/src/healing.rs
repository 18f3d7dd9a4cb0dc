//! Network healing.
//!
//! Refreshes neighbor tables and return routes after the topology changed.
//! Only one heal (whole network or single node) runs at a time, and never
//! next to an inclusion, exclusion or replacement. The healing flag lives in
//! a `watch` channel so in-flight requests can be dropped the moment a run is
//! stopped.
//!
//! A whole-network run heals listening nodes breadth-first from the
//! controller's own neighbors, then sweeps whatever the traversal did not
//! reach, then heals sleeping nodes concurrently.

use crate::command::{Command, Encapsulation};
use crate::controller::Controller;
use crate::error::{ControllerError, ControllerResult, TransportError};
use crate::events::ControllerEvent;
use crate::transport::{NeighborUpdateStatus, Request, Response};
use futures_util::future::join_all;
use homemesh_core::types::is_valid_node_id;
use homemesh_core::{Device, HealingSection, NodeId, NodeStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Most return routes a node is given.
pub const MAX_RETURN_ROUTES: usize = 4;

/// Per-node outcome of a whole-network heal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealStatus {
    Pending,
    Skipped,
    Done,
    Failed,
}

/// Options for a whole-network heal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealNetworkOptions {
    /// Heal sleeping nodes too, after every listening node
    pub include_sleeping: bool,
}

impl From<&HealingSection> for HealNetworkOptions {
    fn from(config: &HealingSection) -> Self {
        Self {
            include_sleeping: config.include_sleeping,
        }
    }
}

/// Return-route destinations for a node: the controller first, then the
/// node's association targets in ascending order.
pub fn return_route_destinations(
    own_node_id: NodeId,
    node_id: NodeId,
    targets: impl IntoIterator<Item = NodeId>,
) -> Vec<NodeId> {
    let others: BTreeSet<NodeId> = targets
        .into_iter()
        .filter(|target| *target != own_node_id && *target != node_id && is_valid_node_id(*target))
        .collect();
    iter::once(own_node_id)
        .chain(others)
        .take(MAX_RETURN_ROUTES)
        .collect()
}

/// Observes one run's healing flag. Any change after the run started means
/// it was stopped.
#[derive(Clone)]
pub(crate) struct HealRun {
    flag: watch::Receiver<bool>,
}

impl HealRun {
    fn is_stopped(&self) -> bool {
        self.flag.has_changed().unwrap_or(true)
    }

    async fn stopped(&self) {
        let mut flag = self.flag.clone();
        // a closed channel also ends the run
        let _ = flag.changed().await;
    }
}

pub(crate) struct HealingState {
    active: watch::Sender<bool>,
    progress: Mutex<BTreeMap<NodeId, HealStatus>>,
    /// Set while a whole-network run still owes its final summary
    network_run: AtomicBool,
}

impl HealingState {
    pub(crate) fn new() -> Self {
        let (active, _) = watch::channel(false);
        Self {
            active,
            progress: Mutex::new(BTreeMap::new()),
            network_run: AtomicBool::new(false),
        }
    }

    fn try_start(&self) -> Option<HealRun> {
        let started = self.active.send_if_modified(|active| {
            if *active {
                false
            } else {
                *active = true;
                true
            }
        });
        started.then(|| HealRun {
            flag: self.active.subscribe(),
        })
    }

    /// Clear the flag unless someone already stopped this run.
    fn finish(&self, run: &HealRun) {
        if !run.is_stopped() {
            self.stop();
        }
    }

    fn stop(&self) -> bool {
        self.active
            .send_if_modified(|active| std::mem::replace(active, false))
    }

    fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    fn progress(&self) -> MutexGuard<'_, BTreeMap<NodeId, HealStatus>> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Controller {
    pub fn is_healing_active(&self) -> bool {
        self.healing.is_active()
    }

    /// Snapshot of the current or last whole-network run.
    pub fn heal_progress(&self) -> BTreeMap<NodeId, HealStatus> {
        self.healing.progress().clone()
    }

    /// Options taken from the `[healing]` configuration.
    pub fn heal_network_options(&self) -> HealNetworkOptions {
        HealNetworkOptions::from(&self.config.healing)
    }

    /// Heal the whole network and wait for the run to end.
    pub async fn heal_network(
        &self,
        options: HealNetworkOptions,
    ) -> ControllerResult<BTreeMap<NodeId, HealStatus>> {
        let run = self.start_network_heal()?;
        Ok(self.drive_network_heal(run, options).await)
    }

    /// Start healing the whole network in the background.
    ///
    /// Returns [`ControllerError::HealingActive`] if a heal already runs.
    /// Progress and the final summary arrive as events.
    pub fn begin_healing_network(self: &Arc<Self>, options: HealNetworkOptions) -> ControllerResult<()> {
        let run = self.start_network_heal()?;
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.drive_network_heal(run, options).await;
        });
        Ok(())
    }

    /// Stop the running heal. Returns `false` if none runs.
    pub fn stop_healing(&self) -> bool {
        if !self.healing.stop() {
            return false;
        }
        info!("Healing stopped");
        if self.healing.network_run.swap(false, Ordering::SeqCst) {
            self.emit(ControllerEvent::HealNetworkDone(self.heal_progress()));
        }
        true
    }

    /// Heal a single node.
    ///
    /// A node last seen dead is pinged first and skipped with `Ok(false)` if
    /// it still does not answer.
    pub async fn heal_node(&self, node_id: NodeId) -> ControllerResult<bool> {
        if node_id == self.own_node_id() {
            return Err(ControllerError::InvalidState(
                "the controller does not heal itself".to_string(),
            ));
        }
        let status = self.with_registry(|registry| registry.get_or_fail(node_id).map(|d| d.status))?;
        let run = self.claim_healing()?;

        let result = self.heal_single(node_id, status, &run).await;
        self.healing.finish(&run);
        result
    }

    async fn heal_single(&self, node_id: NodeId, status: NodeStatus, run: &HealRun) -> ControllerResult<bool> {
        if status == NodeStatus::Dead && !self.ping(node_id).await? {
            info!(node_id, "Node is dead, not healing it");
            return Ok(false);
        }
        Ok(self.heal_one(node_id, run).await)
    }

    /// Neighbors the firmware knows for a node.
    pub async fn get_node_neighbors(&self, node_id: NodeId) -> ControllerResult<Vec<NodeId>> {
        match self
            .transport
            .send(Request::GetRoutingInfo { node_id })
            .await?
        {
            Response::RoutingInfo(neighbors) => Ok(neighbors),
            _ => Err(TransportError::UnexpectedResponse {
                request: "GetRoutingInfo",
            }
            .into()),
        }
    }

    fn start_network_heal(&self) -> ControllerResult<HealRun> {
        let run = self.claim_healing()?;
        self.healing.network_run.store(true, Ordering::SeqCst);
        Ok(run)
    }

    /// Raise the healing flag unless a heal or an inclusion, exclusion or
    /// replacement is already running.
    fn claim_healing(&self) -> ControllerResult<HealRun> {
        self.ensure_no_inclusion()?;
        let run = self.healing.try_start().ok_or(ControllerError::HealingActive)?;
        // an operation may have left idle between the check and the flag
        if let Err(e) = self.ensure_no_inclusion() {
            self.healing.stop();
            return Err(e);
        }
        Ok(run)
    }

    fn ensure_no_inclusion(&self) -> ControllerResult<()> {
        let state = self.inclusion_state();
        if state.is_available() {
            return Ok(());
        }
        debug!(state = %state, "Healing not started, controller is busy");
        Err(ControllerError::InvalidState(format!(
            "cannot heal while the controller is {state}"
        )))
    }

    async fn drive_network_heal(&self, run: HealRun, options: HealNetworkOptions) -> BTreeMap<NodeId, HealStatus> {
        info!(include_sleeping = options.include_sleeping, "Healing network");
        self.heal_all(&run, options).await;

        let progress = self.heal_progress();
        if !run.is_stopped() {
            let owes_summary = self.healing.network_run.swap(false, Ordering::SeqCst);
            self.healing.finish(&run);
            if owes_summary {
                info!(nodes = progress.len(), "Network heal done");
                self.emit(ControllerEvent::HealNetworkDone(progress.clone()));
            }
        }
        progress
    }

    async fn heal_all(&self, run: &HealRun, options: HealNetworkOptions) {
        let own = self.own_node_id();
        let (initial, sleeping) = self.with_registry(|registry| {
            let mut initial = BTreeMap::new();
            let mut sleeping = BTreeSet::new();
            for device in registry.iter().filter(|device| device.id != own) {
                let skip = device.status == NodeStatus::Dead
                    || (device.can_sleep() && !options.include_sleeping);
                initial.insert(
                    device.id,
                    if skip {
                        HealStatus::Skipped
                    } else {
                        HealStatus::Pending
                    },
                );
                if device.can_sleep() {
                    sleeping.insert(device.id);
                }
            }
            (initial, sleeping)
        });
        *self.healing.progress() = initial.clone();
        self.emit(ControllerEvent::HealNetworkProgress(initial.clone()));

        let mut pending: BTreeSet<NodeId> = initial
            .iter()
            .filter(|(id, status)| **status == HealStatus::Pending && !sleeping.contains(*id))
            .map(|(id, _)| *id)
            .collect();

        let mut queue = VecDeque::new();
        self.discover(own, &mut pending, &mut queue).await;
        loop {
            while let Some(node_id) = queue.pop_front() {
                if run.is_stopped() {
                    return;
                }
                let healed = self.heal_one(node_id, run).await;
                self.record_heal(run, node_id, healed);
                if run.is_stopped() {
                    return;
                }
                self.discover(node_id, &mut pending, &mut queue).await;
            }
            if pending.is_empty() {
                break;
            }
            debug!(unreached = ?pending, "Healing nodes the traversal did not reach");
            queue.extend(std::mem::take(&mut pending));
        }

        // woken by the user, so no point in doing them one by one
        let sleepers: Vec<NodeId> = initial
            .iter()
            .filter(|(id, status)| **status == HealStatus::Pending && sleeping.contains(*id))
            .map(|(id, _)| *id)
            .collect();
        if run.is_stopped() || sleepers.is_empty() {
            return;
        }
        join_all(sleepers.into_iter().map(|node_id| async move {
            let healed = self.heal_one(node_id, run).await;
            self.record_heal(run, node_id, healed);
        }))
        .await;
    }

    /// Queue the pending neighbors of `node_id`.
    async fn discover(&self, node_id: NodeId, pending: &mut BTreeSet<NodeId>, queue: &mut VecDeque<NodeId>) {
        match self.get_node_neighbors(node_id).await {
            Ok(neighbors) => {
                for neighbor in neighbors {
                    if pending.remove(&neighbor) {
                        queue.push_back(neighbor);
                    }
                }
            }
            Err(e) => debug!(node_id, error = %e, "Could not read neighbors"),
        }
    }

    fn record_heal(&self, run: &HealRun, node_id: NodeId, healed: bool) {
        if run.is_stopped() {
            return;
        }
        let status = if healed {
            HealStatus::Done
        } else {
            HealStatus::Failed
        };
        let snapshot = {
            let mut progress = self.healing.progress();
            progress.insert(node_id, status);
            progress.clone()
        };
        self.emit(ControllerEvent::HealNetworkProgress(snapshot));
    }

    /// Heal one node, keeping it awake for the duration.
    async fn heal_one(&self, node_id: NodeId, run: &HealRun) -> bool {
        let Some(device) = self.node(node_id) else {
            warn!(node_id, "Cannot heal unknown node");
            return false;
        };
        let kept_awake = device.keep_awake;
        if !kept_awake {
            self.update_device(node_id, |device| device.keep_awake = true);
        }

        info!(node_id, "Healing node");
        let healed = self.heal_steps(&device, run).await;
        if healed {
            info!(node_id, "Node healed");
        } else {
            warn!(node_id, "Healing node failed");
        }

        if !kept_awake {
            self.update_device(node_id, |device| device.keep_awake = false);
            if device.can_sleep() {
                if let Err(e) = self
                    .send_command(
                        node_id,
                        Command::WakeUpNoMoreInformation,
                        Encapsulation::for_device(&device),
                    )
                    .await
                {
                    debug!(node_id, error = %e, "Could not send the node back to sleep");
                }
            }
        }
        healed
    }

    async fn heal_steps(&self, device: &Device, run: &HealRun) -> bool {
        let node_id = device.id;

        if !self
            .heal_step(run, "neighbor update", vec![Request::RequestNeighborUpdate { node_id }], |r| {
                matches!(r, Response::NeighborUpdate(NeighborUpdateStatus::Done))
            })
            .await
        {
            return false;
        }

        // recreated whatever the delete reported
        self.heal_step(
            run,
            "delete SUC return route",
            vec![Request::DeleteSucReturnRoute { node_id }],
            route_ok,
        )
        .await;
        if run.is_stopped() {
            return false;
        }
        if !self
            .heal_step(
                run,
                "assign SUC return route",
                vec![Request::AssignSucReturnRoute { node_id }],
                route_ok,
            )
            .await
        {
            return false;
        }
        self.update_device(node_id, |device| device.has_suc_return_route = true);

        if !self
            .heal_step(
                run,
                "delete return routes",
                vec![Request::DeleteReturnRoutes { node_id }],
                route_ok,
            )
            .await
        {
            return false;
        }

        let assign: Vec<Request> = return_route_destinations(
            self.own_node_id(),
            node_id,
            device.association_destinations(),
        )
        .into_iter()
        .map(|destination| Request::AssignReturnRoute {
            node_id,
            destination,
        })
        .collect();
        self.heal_step(run, "assign return routes", assign, route_ok).await
    }

    /// Send `requests` in order until `accept` takes every response or the
    /// attempts run out. A rejected request restarts the whole step.
    async fn heal_step(
        &self,
        run: &HealRun,
        step: &'static str,
        requests: Vec<Request>,
        accept: fn(&Response) -> bool,
    ) -> bool {
        let node_id = requests.first().and_then(Request::target_node).unwrap_or_default();
        let attempts = self.config.healing.max_attempts.max(1);
        'attempts: for attempt in 1..=attempts {
            for request in &requests {
                if run.is_stopped() {
                    return false;
                }
                match self.heal_request(run, request.clone()).await {
                    Ok(response) if accept(&response) => {}
                    Ok(response) => {
                        debug!(node_id, step, attempt, response = ?response, "Heal step rejected");
                        continue 'attempts;
                    }
                    Err(TransportError::Aborted) => return false,
                    Err(e) => {
                        debug!(node_id, step, attempt, error = %e, "Heal step failed");
                        continue 'attempts;
                    }
                }
            }
            return true;
        }
        warn!(node_id, step, attempts, "Heal step gave up");
        false
    }

    /// Send a heal request, dropping it if the run is stopped meanwhile.
    async fn heal_request(&self, run: &HealRun, request: Request) -> Result<Response, TransportError> {
        tokio::select! {
            biased;
            _ = run.stopped() => Err(TransportError::Aborted),
            response = self.transport.send(request) => response,
        }
    }
}

fn route_ok(response: &Response) -> bool {
    matches!(response, Response::Ack | Response::RouteAssigned(true))
}
