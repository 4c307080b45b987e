//! Transport collaborators.
//!
//! The registry core never opens sockets or watches processes itself. It
//! consumes a [`Transport`] that carries replicated mutations between nodes,
//! reports cluster membership and signals agent termination.
//!
//! Two implementations ship with the crate:
//!
//! - [`memory::MemoryCluster`]: an in-process hub with partition controls
//! - [`tcp::TcpTransport`]: length-prefixed JSON-RPC 2.0 over TCP

mod agent;
pub mod memory;
pub mod tcp;

pub use agent::{AgentDirectory, AgentHandle, Termination};
pub use memory::{MemoryCluster, MemoryTransport};
pub use tcp::{TcpTransport, TcpTransportConfig};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::models::{AgentRef, NodeId};
use crate::replication::ReplicaMutation;

/// A change in cluster membership as seen from one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "node", rename_all = "snake_case")]
pub enum MembershipEvent {
    Joined(NodeId),
    Departed(NodeId),
}

/// Receiver of inbound replication traffic, installed with [`Transport::bind`].
pub trait ReplicaEndpoint: Send + Sync + 'static {
    /// Merge a mutation delivered by a peer.
    fn apply(&self, mutation: ReplicaMutation);

    /// Everything this node has authored, for a peer catching up.
    fn snapshot(&self) -> Vec<ReplicaMutation>;
}

/// Messaging runtime consumed by the registry.
///
/// Transports hold the bound endpoint weakly; dropping the service detaches it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_node(&self) -> NodeId;

    /// Host advertised for agents spawned on this node.
    fn local_host(&self) -> String;

    fn bind(&self, endpoint: Arc<dyn ReplicaEndpoint>);

    /// Best-effort delivery to every reachable member.
    ///
    /// Fails with `MembershipUnavailable` when peers are known but none
    /// could be reached.
    async fn broadcast(&self, mutation: &ReplicaMutation) -> Result<()>;

    /// Membership changes, starting with `Joined` for each current member.
    fn membership_events(&self) -> BoxStream<'static, MembershipEvent>;

    async fn request_snapshot(&self, node: &NodeId) -> Result<Vec<ReplicaMutation>>;

    fn subscribe_termination(&self, reference: &AgentRef) -> Termination;

    /// Create a live agent hosted on this node.
    fn spawn_agent(&self, name: &str) -> AgentHandle;
}

/// Fan-out of membership events to any number of subscribers.
#[derive(Default)]
pub(crate) struct MembershipFeed {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<MembershipEvent>>>,
}

impl MembershipFeed {
    /// Subscribe, seeding the stream with `Joined` for `current` members.
    ///
    /// Callers hold the lock guarding their member table across this call
    /// and every [`MembershipFeed::publish`], so no event falls in between.
    pub(crate) fn subscribe(
        &self,
        current: impl IntoIterator<Item = NodeId>,
    ) -> BoxStream<'static, MembershipEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for node in current {
            let _ = tx.send(MembershipEvent::Joined(node));
        }
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);

        stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        })
        .boxed()
    }

    pub(crate) fn publish(&self, event: MembershipEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
