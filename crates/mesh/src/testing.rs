//! In-memory mesh for tests and demos.
//!
//! [`SimulatedNetwork`] implements [`Transport`] over a set of [`SimNode`]s.
//! Nodes answer firmware requests and play the device side of both security
//! handshakes. The modern handshake runs a real X25519 exchange, so a wrong
//! PIN on the controller side yields a temporary key the node does not share
//! and its traffic becomes undecodable, just like on a real radio.

use crate::callbacks::{GrantRequest, InclusionUserCallbacks};
use crate::command::{Command, EcdhProfile, Encapsulation, InboundCommand, KexFailType, KexParameters, KexScheme};
use crate::controller::BootstrapCanceller;
use crate::error::TransportError;
use crate::transport::{
    AddNodeMode, AddNodeStatus, CommandFilter, NeighborUpdateStatus, NodeInfo, RemoveNodeStatus,
    Request, Response, Transport,
};
use async_trait::async_trait;
use homemesh_core::{CommandClass, DeviceClass, NodeId, SecurityClass};
use homemesh_crypto::{
    derive_temp_keys, Dsk, EcdhKeyPair, KeyStore, NetworkKey, NETWORK_KEY_LENGTH, PUBLIC_KEY_LENGTH,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

type KeyBytes = [u8; NETWORK_KEY_LENGTH];

/// A message a node sent, waiting to be picked up by the controller.
#[derive(Debug, Clone)]
struct Outbound {
    source: NodeId,
    command: Command,
    security: SecurityClass,
    /// Key the node encrypted with, `None` for plaintext
    key: Option<KeyBytes>,
}

impl Outbound {
    fn plain(source: NodeId, command: Command) -> Self {
        Self {
            source,
            command,
            security: SecurityClass::None,
            key: None,
        }
    }

    fn secured(source: NodeId, command: Command, security: SecurityClass, key: KeyBytes) -> Self {
        Self {
            source,
            command,
            security,
            key: Some(key),
        }
    }
}

/// Device side of the modern handshake.
#[derive(Clone)]
struct S2Device {
    requested: Vec<SecurityClass>,
    schemes: Vec<KexScheme>,
    fail_with: Option<KexFailType>,
    echo_override: Option<Vec<SecurityClass>>,
    /// Shared between clones; the secret is consumed by the first exchange
    keypair: Arc<Mutex<Option<EcdhKeyPair>>>,
    public_key: [u8; PUBLIC_KEY_LENGTH],
    granted: Vec<SecurityClass>,
    remaining: Vec<SecurityClass>,
    current: Option<SecurityClass>,
    temp_key: Option<KeyBytes>,
    received: BTreeMap<SecurityClass, NetworkKey>,
}

impl S2Device {
    fn new(requested: Vec<SecurityClass>) -> Self {
        let keypair = EcdhKeyPair::generate();
        Self {
            requested,
            schemes: vec![KexScheme::Kex1],
            fail_with: None,
            echo_override: None,
            public_key: keypair.public_bytes(),
            keypair: Arc::new(Mutex::new(Some(keypair))),
            granted: Vec::new(),
            remaining: Vec::new(),
            current: None,
            temp_key: None,
            received: BTreeMap::new(),
        }
    }

    fn temporary(&self, source: NodeId, command: Command) -> Vec<Outbound> {
        match self.temp_key {
            Some(key) => vec![Outbound::secured(source, command, SecurityClass::Temporary, key)],
            None => Vec::new(),
        }
    }

    fn receive(&mut self, id: NodeId, command: Command) -> Vec<Outbound> {
        match command {
            Command::KexGet => {
                if let Some(reason) = self.fail_with {
                    return vec![Outbound::plain(id, Command::KexFail(reason))];
                }
                vec![Outbound::plain(
                    id,
                    Command::KexReport(KexParameters {
                        echo: false,
                        request_csa: false,
                        schemes: self.schemes.clone(),
                        curves: vec![EcdhProfile::Curve25519],
                        keys: self.requested.clone(),
                    }),
                )]
            }
            Command::KexSet(params) if !params.echo => {
                self.granted = params.keys.clone();
                // weakest first, the controller must not care about the order
                self.remaining = params.keys.into_iter().rev().collect();
                let mut public_key = self.public_key;
                if self.granted.iter().any(|class| class.requires_authentication()) {
                    public_key[..2].fill(0);
                }
                vec![Outbound::plain(
                    id,
                    Command::PublicKeyReport {
                        including_node: false,
                        public_key,
                    },
                )]
            }
            Command::PublicKeyReport {
                including_node: true,
                public_key,
            } => {
                let keypair = self
                    .keypair
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                let Some(mut keypair) = keypair else {
                    return Vec::new();
                };
                let Ok(shared) = keypair.compute_shared_secret(&public_key) else {
                    return Vec::new();
                };
                let temp = derive_temp_keys(&shared, &public_key, &self.public_key);
                self.temp_key = Some(temp.key);
                let echoed = self
                    .echo_override
                    .clone()
                    .unwrap_or_else(|| self.granted.clone());
                self.temporary(
                    id,
                    Command::KexSet(KexParameters {
                        echo: true,
                        ..KexParameters::new(echoed)
                    }),
                )
            }
            Command::KexReport(params) if params.echo => self.next_request(id),
            Command::NetworkKeyReport { class, key } => {
                let bytes = *key.as_bytes();
                self.received.insert(class, key);
                vec![Outbound::secured(id, Command::NetworkKeyVerify, class, bytes)]
            }
            Command::TransferEnd {
                key_verified: true,
                ..
            } => {
                if let Some(done) = self.current.take() {
                    self.remaining.retain(|class| *class != done);
                }
                self.next_request(id)
            }
            _ => Vec::new(),
        }
    }

    fn next_request(&mut self, id: NodeId) -> Vec<Outbound> {
        match self.remaining.first().copied() {
            Some(class) => {
                self.current = Some(class);
                self.temporary(id, Command::NetworkKeyGet { class })
            }
            None => self.temporary(
                id,
                Command::TransferEnd {
                    key_verified: false,
                    key_request_complete: true,
                },
            ),
        }
    }
}

/// A simulated mesh member.
#[derive(Clone)]
pub struct SimNode {
    id: NodeId,
    reachable: bool,
    device_class: DeviceClass,
    is_listening: bool,
    is_frequent_listening: bool,
    supported: BTreeSet<CommandClass>,
    neighbors: Vec<NodeId>,
    neighbor_update_ok: bool,
    response_delay: Duration,
    wake_up_interval: Option<u32>,
    s0: bool,
    s0_nonce: Option<[u8; 8]>,
    s0_key: Option<NetworkKey>,
    s2: Option<S2Device>,
    kex_fail: Option<KexFailType>,
    associations: BTreeMap<u8, Vec<NodeId>>,
    wake_up_destination: Option<(u32, NodeId)>,
    return_routes: Vec<NodeId>,
    rejected_route_assignments: BTreeSet<usize>,
    route_assignments: usize,
}

impl SimNode {
    /// An always-listening binary switch.
    pub fn listening(id: NodeId) -> Self {
        Self {
            id,
            reachable: true,
            device_class: DeviceClass::new(0x04, 0x10, 0x01),
            is_listening: true,
            is_frequent_listening: false,
            supported: BTreeSet::new(),
            neighbors: Vec::new(),
            neighbor_update_ok: true,
            response_delay: Duration::ZERO,
            wake_up_interval: None,
            s0: false,
            s0_nonce: None,
            s0_key: None,
            s2: None,
            kex_fail: None,
            associations: BTreeMap::new(),
            wake_up_destination: None,
            return_routes: Vec::new(),
            rejected_route_assignments: BTreeSet::new(),
            route_assignments: 0,
        }
    }

    /// A battery powered sensor, currently awake.
    pub fn sleeping(id: NodeId) -> Self {
        let mut node = Self::listening(id);
        node.device_class = DeviceClass::new(0x04, 0x07, 0x01);
        node.is_listening = false;
        node.supported.insert(CommandClass::WakeUp);
        node
    }

    pub fn with_device_class(mut self, device_class: DeviceClass) -> Self {
        self.device_class = device_class;
        self
    }

    pub fn with_command_classes(mut self, classes: impl IntoIterator<Item = CommandClass>) -> Self {
        self.supported.extend(classes);
        self
    }

    /// Speak the legacy security protocol.
    pub fn with_s0(mut self) -> Self {
        self.s0 = true;
        self.supported.insert(CommandClass::Security);
        self
    }

    /// Speak the modern security protocol and request `classes`.
    pub fn with_s2(mut self, classes: Vec<SecurityClass>) -> Self {
        self.s2 = Some(S2Device::new(classes));
        self.supported.insert(CommandClass::Security2);
        self
    }

    /// Advertise no key-exchange scheme.
    pub fn without_schemes(mut self) -> Self {
        if let Some(s2) = self.s2.as_mut() {
            s2.schemes.clear();
        }
        self
    }

    /// Answer the key-exchange request with an abort.
    pub fn failing_with(mut self, reason: KexFailType) -> Self {
        if let Some(s2) = self.s2.as_mut() {
            s2.fail_with = Some(reason);
        }
        self
    }

    /// Echo `classes` instead of what was granted.
    pub fn with_echo(mut self, classes: Vec<SecurityClass>) -> Self {
        if let Some(s2) = self.s2.as_mut() {
            s2.echo_override = Some(classes);
        }
        self
    }

    pub fn with_neighbors(mut self, neighbors: impl IntoIterator<Item = NodeId>) -> Self {
        self.neighbors = neighbors.into_iter().collect();
        self
    }

    pub fn with_failing_neighbor_update(mut self) -> Self {
        self.neighbor_update_ok = false;
        self
    }

    /// Reject the return-route assignments at these positions, counted from 0.
    pub fn with_rejected_route_assignments(mut self, positions: impl IntoIterator<Item = usize>) -> Self {
        self.rejected_route_assignments = positions.into_iter().collect();
        self
    }

    /// Delay every answer to a request addressed to this node.
    pub fn with_delay_ms(mut self, millis: u64) -> Self {
        self.response_delay = Duration::from_millis(millis);
        self
    }

    /// Report this wake-up interval when asked.
    pub fn with_wake_up_interval(mut self, seconds: u32) -> Self {
        self.wake_up_interval = Some(seconds);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// DSK of a node speaking the modern protocol.
    pub fn dsk(&self) -> Option<Dsk> {
        self.s2
            .as_ref()
            .map(|s2| Dsk::from_public_key(&s2.public_key))
    }

    /// The PIN printed on the device, as a user would type it.
    pub fn pin(&self) -> Option<String> {
        self.dsk().map(|dsk| format!("{:05}", dsk.pin()))
    }

    /// What the node announces when it joins.
    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.id,
            device_class: self.device_class,
            supported: self.supported.iter().copied().collect(),
            controlled: Vec::new(),
            is_listening: self.is_listening,
            is_frequent_listening: self.is_frequent_listening,
        }
    }

    fn reply(&self, command: Command) -> Outbound {
        Outbound::plain(self.id, command)
    }

    fn receive(&mut self, command: Command, encapsulation: Encapsulation, keys: &dyn KeyStore) -> Vec<Outbound> {
        let id = self.id;
        if encapsulation == Encapsulation::Class(SecurityClass::Temporary) {
            let ours = self.s2.as_ref().and_then(|s2| s2.temp_key);
            let theirs = keys.temporary_key(id).map(|temp| temp.key);
            if ours.is_none() || ours != theirs {
                return Vec::new();
            }
        }

        match command {
            Command::NoOperation => Vec::new(),
            Command::S0SchemeGet if self.s0 => vec![self.reply(Command::S0SchemeReport)],
            Command::S0NonceGet if self.s0 => {
                let nonce: [u8; 8] = rand::random();
                self.s0_nonce = Some(nonce);
                vec![self.reply(Command::S0NonceReport { nonce })]
            }
            Command::S0NetworkKeySet { key } if self.s0 => {
                let issued = self.s0_nonce.take();
                match encapsulation {
                    Encapsulation::S0KeyDelivery { receiver_nonce } if issued == Some(receiver_nonce) => {
                        let bytes = *key.as_bytes();
                        self.s0_key = Some(key);
                        vec![Outbound::secured(
                            id,
                            Command::S0NetworkKeyVerify,
                            SecurityClass::S0Legacy,
                            bytes,
                        )]
                    }
                    _ => Vec::new(),
                }
            }
            Command::KexFail(reason) => {
                self.kex_fail = Some(reason);
                Vec::new()
            }
            Command::AssociationSet { group, node_ids }
            | Command::MultiChannelAssociationSet { group, node_ids } => {
                self.associations.insert(group, node_ids);
                Vec::new()
            }
            Command::WakeUpIntervalGet => match self.wake_up_interval {
                Some(seconds) => vec![self.reply(Command::WakeUpIntervalReport {
                    seconds,
                    node_id: self.wake_up_destination.map(|(_, to)| to).unwrap_or(0),
                })],
                None => Vec::new(),
            },
            Command::WakeUpIntervalSet { seconds, node_id } => {
                self.wake_up_destination = Some((seconds, node_id));
                Vec::new()
            }
            other => match self.s2.as_mut() {
                Some(s2) => s2.receive(id, other),
                None => Vec::new(),
            },
        }
    }
}

struct SimState {
    controller_id: NodeId,
    controller_neighbors: Vec<NodeId>,
    nodes: BTreeMap<NodeId, SimNode>,
    outbox: Vec<Outbound>,
    fail_add_node: bool,
    replace_flags: u8,
    requests: Vec<Request>,
}

impl SimState {
    fn is_reachable(&self, node_id: NodeId) -> bool {
        self.nodes.get(&node_id).is_some_and(|node| node.reachable)
    }
}

/// A [`Transport`] backed by simulated nodes.
pub struct SimulatedNetwork {
    keys: Arc<dyn KeyStore>,
    canceller: OnceLock<BootstrapCanceller>,
    state: Mutex<SimState>,
    arrived: Notify,
}

impl SimulatedNetwork {
    /// `keys` must be the controller's key store; the simulation uses it to
    /// decide which node traffic the controller can decrypt.
    pub fn new(keys: Arc<dyn KeyStore>) -> Self {
        Self {
            keys,
            canceller: OnceLock::new(),
            state: Mutex::new(SimState {
                controller_id: 1,
                controller_neighbors: Vec::new(),
                nodes: BTreeMap::new(),
                outbox: Vec::new(),
                fail_add_node: false,
                replace_flags: 0,
                requests: Vec::new(),
            }),
            arrived: Notify::new(),
        }
    }

    /// Report undecodable handshake traffic to the controller.
    pub fn attach_canceller(&self, canceller: BootstrapCanceller) {
        let _ = self.canceller.set(canceller);
    }

    pub fn add_node(&self, node: SimNode) {
        self.lock().nodes.insert(node.id, node);
    }

    pub fn set_reachable(&self, node_id: NodeId, reachable: bool) {
        if let Some(node) = self.lock().nodes.get_mut(&node_id) {
            node.reachable = reachable;
        }
    }

    pub fn set_controller_neighbors(&self, neighbors: impl IntoIterator<Item = NodeId>) {
        self.lock().controller_neighbors = neighbors.into_iter().collect();
    }

    /// Make the firmware refuse to open the network.
    pub fn fail_add_node(&self, fail: bool) {
        self.lock().fail_add_node = fail;
    }

    /// Start flags returned for replace requests.
    pub fn set_replace_flags(&self, flags: u8) {
        self.lock().replace_flags = flags;
    }

    /// Every request sent so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.lock().requests.clone()
    }

    /// Commands sent to one node, in order.
    pub fn commands_to(&self, node_id: NodeId) -> Vec<Command> {
        self.lock()
            .requests
            .iter()
            .filter_map(|request| match request {
                Request::SendData {
                    node_id: to,
                    command,
                    ..
                } if *to == node_id => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn received_s0_key(&self, node_id: NodeId) -> bool {
        let received = self.node_state(node_id, |node| node.s0_key.clone()).flatten();
        received.is_some() && received == self.keys.legacy_key()
    }

    /// Whether the node holds the controller's key for `class`.
    pub fn received_class_key(&self, node_id: NodeId, class: SecurityClass) -> bool {
        let received = self
            .node_state(node_id, |node| {
                node.s2.as_ref().and_then(|s2| s2.received.get(&class).cloned())
            })
            .flatten();
        received.is_some() && received == self.keys.class_key(class)
    }

    /// Abort reason the node was sent, if any.
    pub fn kex_fail_received(&self, node_id: NodeId) -> Option<KexFailType> {
        self.node_state(node_id, |node| node.kex_fail).flatten()
    }

    pub fn association(&self, node_id: NodeId, group: u8) -> Option<Vec<NodeId>> {
        self.node_state(node_id, |node| node.associations.get(&group).cloned())
            .flatten()
    }

    pub fn wake_up_destination(&self, node_id: NodeId) -> Option<(u32, NodeId)> {
        self.node_state(node_id, |node| node.wake_up_destination)
            .flatten()
    }

    /// Return routes currently assigned to a node.
    pub fn return_routes(&self, node_id: NodeId) -> Vec<NodeId> {
        self.node_state(node_id, |node| node.return_routes.clone())
            .unwrap_or_default()
    }

    fn node_state<R>(&self, node_id: NodeId, f: impl FnOnce(&SimNode) -> R) -> Option<R> {
        self.lock().nodes.get(&node_id).map(f)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn decodable(&self, message: &Outbound) -> bool {
        match message.security {
            SecurityClass::None => true,
            SecurityClass::Temporary => {
                self.keys.temporary_key(message.source).map(|temp| temp.key) == message.key
            }
            class => self.keys.class_key(class).map(|key| *key.as_bytes()) == message.key,
        }
    }

    /// Take the first decodable message `filter` accepts. Returns the nodes
    /// whose temporary-key traffic could not be decoded.
    fn take_matching(&self, filter: &CommandFilter) -> (Option<InboundCommand>, Vec<NodeId>) {
        let mut state = self.lock();
        let mut undecodable = Vec::new();
        state.outbox.retain(|message| {
            if message.security == SecurityClass::Temporary && !self.decodable(message) {
                undecodable.push(message.source);
                false
            } else {
                true
            }
        });

        let position = state.outbox.iter().position(|message| {
            self.decodable(message)
                && filter(&InboundCommand {
                    source: message.source,
                    command: message.command.clone(),
                })
        });
        let found = position.map(|index| state.outbox.remove(index)).map(|message| {
            self.keys.record_inbound(message.source, message.security);
            InboundCommand {
                source: message.source,
                command: message.command,
            }
        });
        (found, undecodable)
    }

    fn respond(&self, request: Request) -> Result<Response, TransportError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match request {
            Request::AddNode { mode, .. } => {
                let status = if state.fail_add_node && mode != AddNodeMode::Stop {
                    AddNodeStatus::Failed
                } else {
                    AddNodeStatus::Ready
                };
                Ok(Response::AddNode(status))
            }
            Request::RemoveNode { .. } => Ok(Response::RemoveNode(RemoveNodeStatus::Ready)),
            Request::IsFailedNode { node_id } => Ok(Response::FailedNode(!state.is_reachable(node_id))),
            Request::ReplaceFailedNode { .. } => Ok(Response::ReplaceStarted {
                flags: state.replace_flags,
            }),
            Request::RequestNeighborUpdate { node_id } => {
                let ok = state
                    .nodes
                    .get(&node_id)
                    .is_some_and(|node| node.reachable && node.neighbor_update_ok);
                Ok(Response::NeighborUpdate(if ok {
                    NeighborUpdateStatus::Done
                } else {
                    NeighborUpdateStatus::Failed
                }))
            }
            Request::GetRoutingInfo { node_id } => {
                let neighbors = if node_id == state.controller_id {
                    state.controller_neighbors.clone()
                } else {
                    state
                        .nodes
                        .get(&node_id)
                        .map(|node| node.neighbors.clone())
                        .unwrap_or_default()
                };
                Ok(Response::RoutingInfo(neighbors))
            }
            Request::DeleteSucReturnRoute { node_id } | Request::AssignSucReturnRoute { node_id } => {
                Ok(Response::RouteAssigned(state.is_reachable(node_id)))
            }
            Request::DeleteReturnRoutes { node_id } => {
                let node = state.nodes.get_mut(&node_id).filter(|node| node.reachable);
                let deleted = node.map(|node| node.return_routes.clear()).is_some();
                Ok(Response::RouteAssigned(deleted))
            }
            Request::AssignReturnRoute {
                node_id,
                destination,
            } => {
                let node = state.nodes.get_mut(&node_id).filter(|node| node.reachable);
                let assigned = node.is_some_and(|node| {
                    let position = node.route_assignments;
                    node.route_assignments += 1;
                    if node.rejected_route_assignments.contains(&position) {
                        return false;
                    }
                    // a repeated assignment replaces the route to that destination
                    if !node.return_routes.contains(&destination) {
                        node.return_routes.push(destination);
                    }
                    true
                });
                Ok(Response::RouteAssigned(assigned))
            }
            Request::SendData {
                node_id,
                command,
                encapsulation,
            } => {
                let Some(node) = state.nodes.get_mut(&node_id).filter(|node| node.reachable) else {
                    return Err(TransportError::NoAck { node_id });
                };
                let replies = node.receive(command, encapsulation, self.keys.as_ref());
                state.outbox.extend(replies);
                Ok(Response::Ack)
            }
        }
    }
}

#[async_trait]
impl Transport for SimulatedNetwork {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let delay = {
            let mut state = self.lock();
            state.requests.push(request.clone());
            request
                .target_node()
                .and_then(|node_id| state.nodes.get(&node_id))
                .map(|node| node.response_delay)
                .unwrap_or_default()
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let response = self.respond(request);
        self.arrived.notify_waiters();
        response
    }

    async fn wait_for_command(
        &self,
        filter: CommandFilter,
        timeout: Duration,
    ) -> Result<InboundCommand, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let arrived = self.arrived.notified();
            let (found, undecodable) = self.take_matching(&filter);
            if let Some(canceller) = self.canceller.get() {
                for node_id in undecodable {
                    canceller.cancel_node(node_id, KexFailType::Decrypt);
                }
            }
            if let Some(inbound) = found {
                return Ok(inbound);
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Err(TransportError::Timeout);
            }
        }
    }
}

/// Canned answers to grant and PIN prompts.
pub struct ScriptedCallbacks {
    grant: Option<Vec<SecurityClass>>,
    pin: Option<String>,
    pin_prompts: AtomicUsize,
    aborted: AtomicBool,
    masked_dsk: Mutex<Option<String>>,
}

impl ScriptedCallbacks {
    /// Grant `classes` and answer the PIN prompt with `pin`.
    pub fn granting(classes: Vec<SecurityClass>, pin: Option<String>) -> Self {
        Self {
            grant: Some(classes),
            pin,
            pin_prompts: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            masked_dsk: Mutex::new(None),
        }
    }

    /// Refuse every grant.
    pub fn declining() -> Self {
        Self {
            grant: None,
            ..Self::granting(Vec::new(), None)
        }
    }

    pub fn pin_prompts(&self) -> usize {
        self.pin_prompts.load(Ordering::SeqCst)
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// The DSK shown with the last PIN prompt.
    pub fn masked_dsk(&self) -> Option<String> {
        self.masked_dsk
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl InclusionUserCallbacks for ScriptedCallbacks {
    async fn grant_security_classes(&self, _request: GrantRequest) -> Option<Vec<SecurityClass>> {
        self.grant.clone()
    }

    async fn validate_dsk_and_enter_pin(&self, masked_dsk: String) -> Option<String> {
        self.pin_prompts.fetch_add(1, Ordering::SeqCst);
        *self
            .masked_dsk
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(masked_dsk);
        self.pin.clone()
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}
