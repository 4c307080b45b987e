//! Node state shared between the façade, the transport and background loops.

use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{LocationError, Result};
use crate::liveness::{LivenessWatcher, TerminationEvent, WatchScope};
use crate::models::NodeId;
use crate::registry::LocalRegistry;
use crate::replication::{Distributor, HealthMonitor, ReplicaCache, ReplicaMutation};
use crate::transport::{MembershipEvent, ReplicaEndpoint, Transport};

/// Everything one registry node owns.
///
/// Held in an `Arc` by the service; the transport and the background loops
/// only keep weak references, so dropping the service tears everything down.
pub(crate) struct NodeState {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) registry: LocalRegistry,
    pub(crate) replica: Arc<ReplicaCache>,
    pub(crate) watcher: LivenessWatcher,
    pub(crate) distributor: Distributor,
    pub(crate) health: Arc<HealthMonitor>,
    pub(crate) watch_replicas: bool,
    pub(crate) stopped: AtomicBool,
}

impl NodeState {
    pub(crate) fn node(&self) -> &NodeId {
        self.registry.node()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(LocationError::ServiceStopped);
        }
        Ok(())
    }

    /// Publish a mutation authored here, re-arming the liveness watch.
    pub(crate) fn publish_owned(&self, mutation: ReplicaMutation) {
        self.watcher.unwatch(&mutation.connection);
        if let Some(reference) = mutation.location().and_then(|l| l.agent_ref()) {
            self.watcher.watch(
                mutation.connection.clone(),
                reference.clone(),
                WatchScope::Owned,
                mutation.version,
            );
        }
        self.distributor.publish(mutation);
    }

    /// Tombstone every owned entry. Returns how many were removed.
    pub(crate) fn withdraw_all(&self) -> usize {
        let tombstones = self.registry.unregister_all();
        let count = tombstones.len();
        for tombstone in tombstones {
            self.publish_owned(tombstone);
        }
        count
    }

    fn handle_termination(&self, event: TerminationEvent) {
        if !self.watcher.fire(&event) {
            debug!("Ignoring stale termination of {}", event.connection);
            return;
        }
        self.watcher.unwatch(&event.connection);

        match event.scope {
            WatchScope::Owned => {
                if let Some(tombstone) = self
                    .registry
                    .unregister_if_version(&event.connection, event.version)
                {
                    info!("Agent behind {} terminated, unregistering", event.connection);
                    self.distributor.publish(tombstone);
                }
            }
            WatchScope::Replica { origin } => {
                if self
                    .replica
                    .reclaim(&event.connection, &origin, event.version)
                {
                    debug!(
                        "Dropped replica of {} from {} after agent termination",
                        event.connection, origin
                    );
                }
            }
        }
    }
}

impl ReplicaEndpoint for NodeState {
    fn apply(&self, mutation: ReplicaMutation) {
        if &mutation.origin == self.node() {
            debug!("Ignoring echo of own mutation {}", mutation.connection);
            return;
        }

        let connection = mutation.connection.clone();
        let origin = mutation.origin.clone();
        let version = mutation.version;
        let reference = mutation
            .location()
            .and_then(|location| location.agent_ref())
            .cloned();

        if !self.replica.merge(mutation).is_applied() {
            return;
        }

        if self.registry.supersede(&connection, version, &origin).is_some() {
            info!("{} now belongs to {}", connection, origin);
        }
        self.watcher.unwatch(&connection);

        if let (true, Some(reference)) = (self.watch_replicas, reference) {
            self.watcher
                .watch(connection, reference, WatchScope::Replica { origin }, version);
        }
    }

    fn snapshot(&self) -> Vec<ReplicaMutation> {
        self.registry.snapshot()
    }
}

// ========================================
// Background loops
// ========================================

/// Act on agent terminations until the node goes away.
pub(crate) async fn reap_terminations(
    state: Weak<NodeState>,
    mut events: mpsc::UnboundedReceiver<TerminationEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        state.handle_termination(event);
    }
    debug!("Termination reaper stopped");
}

/// Follow cluster membership: catch up on joins, evict on departures.
pub(crate) async fn follow_membership(
    state: Weak<NodeState>,
    mut events: BoxStream<'static, MembershipEvent>,
) {
    while let Some(event) = events.next().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        if let MembershipEvent::Departed(node) = &event {
            state.watcher.unwatch_origin(node);
        }
        state
            .distributor
            .handle_membership(&event, state.as_ref())
            .await;
    }
    debug!("Membership loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentRef, ComponentId, ComponentType, Connection, Location};
    use crate::transport::MemoryCluster;

    fn node_state(transport: Arc<dyn Transport>) -> (Arc<NodeState>, mpsc::UnboundedReceiver<TerminationEvent>) {
        let replica = Arc::new(ReplicaCache::new());
        let health = Arc::new(HealthMonitor::new());
        let (watcher, rx) = LivenessWatcher::new(transport.clone());
        let state = Arc::new(NodeState {
            registry: LocalRegistry::new(transport.local_node()),
            distributor: Distributor::new(transport.clone(), replica.clone(), health.clone()),
            transport,
            replica,
            watcher,
            health,
            watch_replicas: true,
            stopped: AtomicBool::new(false),
        });
        (state, rx)
    }

    fn hcd(reference: AgentRef) -> Location {
        let id = ComponentId::new("hcd1", ComponentType::Hcd).unwrap();
        Location::agent(Connection::agent(id), reference).unwrap()
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored() {
        let cluster = MemoryCluster::new();
        let transport = cluster.join("host-a");
        let (state, _rx) = node_state(transport.clone());
        let agent = transport.spawn_agent("hcd1");

        let location = hcd(agent.reference().clone());
        state.apply(ReplicaMutation::live(location.clone(), state.node().clone(), 1));

        assert!(state.replica.get(location.connection()).is_none());
    }

    #[tokio::test]
    async fn test_newer_remote_write_supersedes_owned_entry() {
        let cluster = MemoryCluster::new();
        let transport = cluster.join("host-a");
        let (state, _rx) = node_state(transport.clone());
        let agent = transport.spawn_agent("hcd1");
        let location = hcd(agent.reference().clone());

        let registration = state.registry.register(location.clone(), None).unwrap();
        state.publish_owned(registration.mutation.unwrap());
        assert_eq!(state.watcher.watched(), vec![location.connection().clone()]);

        let other = NodeId::new("zz-other");
        state.apply(ReplicaMutation::tombstone(
            location.connection().clone(),
            other,
            2,
        ));

        assert!(state.registry.get(location.connection()).is_none());
        assert!(state.replica.get(location.connection()).is_none());
        assert!(state.watcher.watched().is_empty());
    }

    #[tokio::test]
    async fn test_owned_termination_reaps_entry() {
        let cluster = MemoryCluster::new();
        let transport = cluster.join("host-a");
        let (state, mut rx) = node_state(transport.clone());
        let agent = transport.spawn_agent("hcd1");
        let location = hcd(agent.reference().clone());

        let registration = state.registry.register(location.clone(), None).unwrap();
        state.publish_owned(registration.mutation.unwrap());

        agent.stop();
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        state.handle_termination(event.clone());

        assert!(state.registry.is_empty());
        assert!(state.replica.get(location.connection()).is_none());
        assert_eq!(state.replica.version_of(location.connection()), Some(2));

        // A duplicate delivery is a no-op.
        state.handle_termination(event);
        assert_eq!(state.replica.version_of(location.connection()), Some(2));
    }

    #[tokio::test]
    async fn test_replica_termination_drops_local_copy_only() {
        let cluster = MemoryCluster::new();
        let transport = cluster.join("host-a");
        let (state, mut rx) = node_state(transport.clone());
        let agent = transport.spawn_agent("hcd1");
        let location = hcd(agent.reference().clone());
        let origin = NodeId::new("b");

        state.apply(ReplicaMutation::live(location.clone(), origin.clone(), 3));
        assert_eq!(state.replica.get(location.connection()), Some(location.clone()));

        agent.stop();
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.scope, WatchScope::Replica { origin });
        state.handle_termination(event);

        assert!(state.replica.get(location.connection()).is_none());
        assert_eq!(state.replica.version_of(location.connection()), Some(3));
        assert!(state.registry.snapshot().is_empty());
    }
}
