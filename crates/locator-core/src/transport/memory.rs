//! In-process cluster for embedding several registry nodes in one process.
//!
//! Delivery is synchronous: a broadcast is merged by every reachable peer
//! before `broadcast` returns. Partitions are simulated with
//! [`MemoryCluster::isolate`] / [`MemoryCluster::heal`] and process death
//! with [`MemoryCluster::crash`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use indexmap::IndexMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, info};

use super::{
    AgentDirectory, AgentHandle, MembershipEvent, MembershipFeed, ReplicaEndpoint, Termination,
    Transport,
};
use crate::error::{LocationError, Result};
use crate::models::{AgentRef, NodeId};
use crate::replication::ReplicaMutation;

struct Member {
    endpoint: Option<Weak<dyn ReplicaEndpoint>>,
    reachable: bool,
    crashed: bool,
    feed: Arc<MembershipFeed>,
}

impl Member {
    fn endpoint(&self) -> Option<Arc<dyn ReplicaEndpoint>> {
        self.endpoint.as_ref().and_then(Weak::upgrade)
    }

    fn is_up(&self) -> bool {
        self.reachable && !self.crashed
    }
}

#[derive(Default)]
struct ClusterState {
    members: RwLock<IndexMap<NodeId, Member>>,
    agents: Arc<AgentDirectory>,
}

impl ClusterState {
    fn read(&self) -> RwLockReadGuard<'_, IndexMap<NodeId, Member>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexMap<NodeId, Member>> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Endpoints that `from` can currently reach.
    fn reachable_peers(&self, from: &NodeId) -> Result<Vec<Arc<dyn ReplicaEndpoint>>> {
        let members = self.read();
        let me = members.get(from).ok_or_else(|| LocationError::MembershipUnavailable {
            message: format!("{} is not a cluster member", from),
        })?;
        let others = members.len() - 1;
        if !me.is_up() && others > 0 {
            return Err(LocationError::MembershipUnavailable {
                message: format!("{} is cut off from {} peers", from, others),
            });
        }

        Ok(members
            .iter()
            .filter(|(node, member)| *node != from && member.is_up())
            .filter_map(|(_, member)| member.endpoint())
            .collect())
    }
}

/// Hub connecting every [`MemoryTransport`] created by [`MemoryCluster::join`].
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with a fresh random identity.
    pub fn join(&self, host: &str) -> Arc<MemoryTransport> {
        self.join_as(NodeId::generate(), host)
    }

    /// Add a node with a caller-chosen identity.
    pub fn join_as(&self, node: NodeId, host: &str) -> Arc<MemoryTransport> {
        let mut members = self.state.write();
        for (_, member) in members.iter().filter(|(_, m)| m.is_up()) {
            member.feed.publish(MembershipEvent::Joined(node.clone()));
        }
        members.insert(
            node.clone(),
            Member {
                endpoint: None,
                reachable: true,
                crashed: false,
                feed: Arc::new(MembershipFeed::default()),
            },
        );
        info!("{} joined the in-memory cluster", node);

        Arc::new(MemoryTransport {
            node,
            host: host.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    /// Cut a node off from every peer. Both sides observe `Departed`.
    pub fn isolate(&self, node: &NodeId) {
        let mut members = self.state.write();
        let Some(member) = members.get_mut(node) else {
            return;
        };
        if !member.is_up() {
            return;
        }
        member.reachable = false;
        let isolated_feed = Arc::clone(&member.feed);

        for (other, member) in members.iter().filter(|(n, m)| *n != node && m.is_up()) {
            member.feed.publish(MembershipEvent::Departed(node.clone()));
            isolated_feed.publish(MembershipEvent::Departed(other.clone()));
        }
        info!("{} isolated", node);
    }

    /// Reconnect an isolated node. Both sides observe `Joined`.
    pub fn heal(&self, node: &NodeId) {
        let mut members = self.state.write();
        let Some(member) = members.get_mut(node) else {
            return;
        };
        if member.reachable || member.crashed {
            return;
        }
        member.reachable = true;
        let healed_feed = Arc::clone(&member.feed);

        for (other, member) in members.iter().filter(|(n, m)| *n != node && m.is_up()) {
            member.feed.publish(MembershipEvent::Joined(node.clone()));
            healed_feed.publish(MembershipEvent::Joined(other.clone()));
        }
        info!("{} healed", node);
    }

    /// Kill a node: peers see it depart and every agent it hosts terminates.
    pub fn crash(&self, node: &NodeId) {
        self.isolate(node);
        if let Some(member) = self.state.write().get_mut(node) {
            member.crashed = true;
            member.endpoint = None;
        }
        let terminated = self.state.agents.terminate_node(node);
        info!("{} crashed ({} agents terminated)", node, terminated);
    }

    pub fn agents(&self) -> &Arc<AgentDirectory> {
        &self.state.agents
    }

    /// Members that are currently up.
    pub fn members(&self) -> Vec<NodeId> {
        self.state
            .read()
            .iter()
            .filter(|(_, m)| m.is_up())
            .map(|(node, _)| node.clone())
            .collect()
    }
}

/// One node's view of a [`MemoryCluster`].
pub struct MemoryTransport {
    node: NodeId,
    host: String,
    state: Arc<ClusterState>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_node(&self) -> NodeId {
        self.node.clone()
    }

    fn local_host(&self) -> String {
        self.host.clone()
    }

    fn bind(&self, endpoint: Arc<dyn ReplicaEndpoint>) {
        if let Some(member) = self.state.write().get_mut(&self.node) {
            member.endpoint = Some(Arc::downgrade(&endpoint));
        }
    }

    async fn broadcast(&self, mutation: &ReplicaMutation) -> Result<()> {
        let peers = self.state.reachable_peers(&self.node)?;
        debug!(
            "{} delivering {} v{} to {} peers",
            self.node,
            mutation.connection,
            mutation.version,
            peers.len()
        );
        for peer in peers {
            peer.apply(mutation.clone());
        }
        Ok(())
    }

    fn membership_events(&self) -> BoxStream<'static, MembershipEvent> {
        let members = self.state.read();
        let feed = match members.get(&self.node) {
            Some(member) => Arc::clone(&member.feed),
            None => Arc::new(MembershipFeed::default()),
        };
        let reachable = members.get(&self.node).map(Member::is_up).unwrap_or(false);
        let current: Vec<NodeId> = members
            .iter()
            .filter(|(node, member)| reachable && *node != &self.node && member.is_up())
            .map(|(node, _)| node.clone())
            .collect();
        feed.subscribe(current)
    }

    async fn request_snapshot(&self, node: &NodeId) -> Result<Vec<ReplicaMutation>> {
        let members = self.state.read();
        let reachable = members.get(&self.node).map(Member::is_up).unwrap_or(false);
        let target = members
            .get(node)
            .filter(|member| reachable && member.is_up())
            .ok_or_else(|| LocationError::MembershipUnavailable {
                message: format!("{} cannot reach {}", self.node, node),
            })?;

        Ok(target
            .endpoint()
            .map(|endpoint| endpoint.snapshot())
            .unwrap_or_default())
    }

    fn subscribe_termination(&self, reference: &AgentRef) -> Termination {
        self.state.agents.subscribe(reference)
    }

    fn spawn_agent(&self, name: &str) -> AgentHandle {
        self.state
            .agents
            .spawn(self.node.clone(), &self.host, name)
    }
}
