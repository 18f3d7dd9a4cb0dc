//! Transport contract between the controller core and the radio.
//!
//! The core issues one [`Request`] at a time and waits for its [`Response`].
//! Commands sent by devices are picked up with
//! [`Transport::wait_for_command`]. Status reports the controller firmware
//! pushes on its own arrive as [`ControllerNotification`]s and are fed to
//! [`Controller::handle_notification`](crate::Controller::handle_notification).

use crate::command::{Command, Encapsulation, InboundCommand};
use crate::error::TransportError;
use async_trait::async_trait;
use homemesh_core::{CommandClass, DeviceClass, NodeId, NodeStatus};
use std::time::Duration;

/// Predicate selecting the inbound command a caller is waiting for.
pub type CommandFilter = Box<dyn Fn(&InboundCommand) -> bool + Send + Sync>;

/// Build a filter matching commands from one node.
pub fn from_node<F>(node_id: NodeId, predicate: F) -> CommandFilter
where
    F: Fn(&Command) -> bool + Send + Sync + 'static,
{
    Box::new(move |inbound| inbound.source == node_id && predicate(&inbound.command))
}

/// Mode of an add-node request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddNodeMode {
    /// Accept any node that presses its button
    Any,
    /// Listen for SmartStart join requests
    SmartStartListen,
    /// Include the SmartStart node announcing this home id
    SmartStartInclude { nwi_home_id: [u8; 4] },
    /// Close the network again
    Stop,
}

/// Mode of a remove-node request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveNodeMode {
    Any,
    Stop,
}

/// Request to the controller firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    AddNode {
        mode: AddNodeMode,
        high_power: bool,
        network_wide: bool,
    },
    RemoveNode {
        mode: RemoveNodeMode,
        high_power: bool,
        network_wide: bool,
    },
    ReplaceFailedNode { node_id: NodeId },
    IsFailedNode { node_id: NodeId },
    RequestNeighborUpdate { node_id: NodeId },
    GetRoutingInfo { node_id: NodeId },
    DeleteSucReturnRoute { node_id: NodeId },
    AssignSucReturnRoute { node_id: NodeId },
    DeleteReturnRoutes { node_id: NodeId },
    AssignReturnRoute { node_id: NodeId, destination: NodeId },
    SendData {
        node_id: NodeId,
        command: Command,
        encapsulation: Encapsulation,
    },
}

impl Request {
    /// Short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Request::AddNode { .. } => "AddNode",
            Request::RemoveNode { .. } => "RemoveNode",
            Request::ReplaceFailedNode { .. } => "ReplaceFailedNode",
            Request::IsFailedNode { .. } => "IsFailedNode",
            Request::RequestNeighborUpdate { .. } => "RequestNeighborUpdate",
            Request::GetRoutingInfo { .. } => "GetRoutingInfo",
            Request::DeleteSucReturnRoute { .. } => "DeleteSucReturnRoute",
            Request::AssignSucReturnRoute { .. } => "AssignSucReturnRoute",
            Request::DeleteReturnRoutes { .. } => "DeleteReturnRoutes",
            Request::AssignReturnRoute { .. } => "AssignReturnRoute",
            Request::SendData { .. } => "SendData",
        }
    }

    /// Node the request is about, if any.
    pub fn target_node(&self) -> Option<NodeId> {
        match self {
            Request::AddNode { .. } | Request::RemoveNode { .. } => None,
            Request::ReplaceFailedNode { node_id }
            | Request::IsFailedNode { node_id }
            | Request::RequestNeighborUpdate { node_id }
            | Request::GetRoutingInfo { node_id }
            | Request::DeleteSucReturnRoute { node_id }
            | Request::AssignSucReturnRoute { node_id }
            | Request::DeleteReturnRoutes { node_id }
            | Request::AssignReturnRoute { node_id, .. }
            | Request::SendData { node_id, .. } => Some(*node_id),
        }
    }
}

/// Status of a neighbor table refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborUpdateStatus {
    Started,
    Done,
    Failed,
}

/// Progress of an add-node operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddNodeStatus {
    Ready,
    NodeFound,
    AddingSlave,
    AddingController,
    ProtocolDone,
    Done,
    Failed,
}

/// Progress of a remove-node operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveNodeStatus {
    Ready,
    NodeFound,
    RemovingSlave,
    RemovingController,
    Done,
    Failed,
}

/// Progress of a replace-failed-node operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceNodeStatus {
    /// The node answered and is not failed
    NodeOk,
    /// The controller is ready to include the replacement
    FailedNodeReplace,
    /// The replacement joined under the old id
    FailedNodeReplaceDone,
    /// The replacement failed
    FailedNodeReplaceFailed,
}

/// Node information announced during a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub device_class: DeviceClass,
    pub supported: Vec<CommandClass>,
    pub controlled: Vec<CommandClass>,
    pub is_listening: bool,
    pub is_frequent_listening: bool,
}

/// Status report of an add-node operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddNodeReport {
    pub status: AddNodeStatus,
    pub node_info: Option<NodeInfo>,
}

/// Status report of a remove-node operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveNodeReport {
    pub status: RemoveNodeStatus,
    pub node_id: Option<NodeId>,
}

/// Response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The request was accepted without further data
    Ack,
    AddNode(AddNodeStatus),
    RemoveNode(RemoveNodeStatus),
    /// Start flags of a replace request; zero means accepted
    ReplaceStarted { flags: u8 },
    FailedNode(bool),
    NeighborUpdate(NeighborUpdateStatus),
    RoutingInfo(Vec<NodeId>),
    RouteAssigned(bool),
}

/// Unsolicited notification pushed by the controller firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerNotification {
    AddNode(AddNodeReport),
    RemoveNode(RemoveNodeReport),
    ReplaceFailedNode {
        node_id: NodeId,
        status: ReplaceNodeStatus,
    },
    /// A SmartStart node announces itself and asks to join
    SmartStartRequest {
        nwi_home_id: [u8; 4],
        node_info: Option<NodeInfo>,
    },
    /// Liveness of a node changed
    NodeStatus { node_id: NodeId, status: NodeStatus },
}

/// The radio as seen by the controller core.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its response.
    async fn send(&self, request: Request) -> Result<Response, TransportError>;

    /// Wait for an inbound command matching `filter`.
    async fn wait_for_command(
        &self,
        filter: CommandFilter,
        timeout: Duration,
    ) -> Result<InboundCommand, TransportError>;
}
