// Collaborator interfaces to other nodes. The broker's wire layer implements
// these; the test harness wires them up in-process.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use felix_common::ids::{ConnectionId, NodeId};
use felix_dispatch::{Discriminator, Selector};
use felix_storage::StoredMessage;

use crate::Result;
use crate::durable::SubscriptionDefinition;
use crate::tick::Tick;

/// A consumer on a requesting node, as seen by the serving node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequesterId {
    pub node: NodeId,
    pub consumer: u64,
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.consumer)
    }
}

/// A remote get: lock one message matching the filter, or report the tick
/// completed once `timeout` passes.
#[derive(Debug, Clone)]
pub struct GetRequest {
    pub requester: RequesterId,
    pub connection: ConnectionId,
    pub selector: Option<Selector>,
    pub discriminator: Option<Discriminator>,
    pub tick: Tick,
    /// None waits until satisfied or cancelled.
    pub timeout: Option<Duration>,
    /// Gathering-mode refill rather than an ordinary get.
    pub refill: bool,
}

/// Requesting side's view of a serving node. Calls never block on a reply.
pub trait RemoteTransport: Send + Sync {
    fn is_reachable(&self, node: NodeId) -> bool;

    fn get(&self, node: NodeId, request: GetRequest) -> Result<()>;

    fn cancel(&self, node: NodeId, requester: RequesterId, tick: Tick) -> Result<()>;

    /// The messages delivered for `ticks` were consumed.
    fn accept(&self, node: NodeId, requester: RequesterId, ticks: &[Tick]) -> Result<()>;

    /// The messages delivered for `ticks` go back to the serving queue.
    fn reject(&self, node: NodeId, requester: RequesterId, ticks: &[Tick]) -> Result<()>;
}

/// Serving side's reply channel back to requesting consumers.
pub trait ReplySink: Send + Sync {
    fn satisfied(&self, requester: RequesterId, tick: Tick, message: Arc<StoredMessage>);

    /// The tick expired or was cancelled without a message.
    fn expired(&self, requester: RequesterId, tick: Tick);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlKind {
    Create(SubscriptionDefinition),
    Delete,
    Attach(SubscriptionDefinition),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    pub tick: Tick,
    pub subscription: String,
    pub kind: ControlKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Ok,
    NotFound,
    NotAuthorized,
    Mismatch,
    Exists,
    InUse,
}

/// Carries durable-subscription control requests to the subscription's home node.
pub trait ControlTransport: Send + Sync {
    fn send(&self, node: NodeId, request: ControlRequest) -> Result<()>;
}
