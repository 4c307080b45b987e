//! Outbound replication and membership handling.
//!
//! Local writes are merged into the replica immediately and queued for
//! broadcast. A single pump task drains the queue in order, so peers see a
//! node's mutations in the order they were authored.
//!
//! A failed broadcast is not retried. Instead the next peer to join receives
//! everything this node authored, which covers peers that missed it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::health::HealthMonitor;
use super::mutation::ReplicaMutation;
use super::replica_cache::{MergeOutcome, ReplicaCache};
use crate::config::ReplicationConfig;
use crate::error::{LocationError, Result};
use crate::models::{Connection, NodeId};
use crate::transport::{MembershipEvent, ReplicaEndpoint, Transport};

enum Outbound {
    Mutation(ReplicaMutation),
    Flush(oneshot::Sender<()>),
}

pub struct Distributor {
    transport: Arc<dyn Transport>,
    replica: Arc<ReplicaCache>,
    health: Arc<HealthMonitor>,
    outbound: mpsc::UnboundedSender<Outbound>,
    pump: JoinHandle<()>,
    members: Mutex<HashSet<NodeId>>,
    /// Set when a broadcast failed since the last resync.
    resync: Arc<AtomicBool>,
}

impl Distributor {
    /// Create the distributor and start its broadcast pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        replica: Arc<ReplicaCache>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        let (outbound, rx) = mpsc::unbounded_channel();
        let resync = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(Self::pump(
            transport.clone(),
            health.clone(),
            resync.clone(),
            rx,
        ));
        Self {
            transport,
            replica,
            health,
            outbound,
            pump,
            members: Mutex::new(HashSet::new()),
            resync,
        }
    }

    async fn pump(
        transport: Arc<dyn Transport>,
        health: Arc<HealthMonitor>,
        resync: Arc<AtomicBool>,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        while let Some(message) = rx.recv().await {
            match message {
                Outbound::Mutation(mutation) => match transport.broadcast(&mutation).await {
                    Ok(()) => health.record_success(),
                    Err(e) => {
                        resync.store(true, Ordering::SeqCst);
                        warn!(
                            "Broadcast of {} v{} failed: {}",
                            mutation.connection, mutation.version, e
                        );
                        health.record_failure(&e);
                    }
                },
                Outbound::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Replication pump stopped");
    }

    fn members(&self) -> MutexGuard<'_, HashSet<NodeId>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge a locally authored mutation and queue it for every peer.
    pub fn publish(&self, mutation: ReplicaMutation) -> MergeOutcome {
        let outcome = self.replica.merge(mutation.clone());
        if outcome.is_applied() {
            if self.outbound.send(Outbound::Mutation(mutation)).is_err() {
                debug!("Replication pump gone; mutation kept local");
            }
        } else {
            debug!(
                "Local mutation {} v{} not applied: {:?}",
                mutation.connection, mutation.version, outcome
            );
        }
        outcome
    }

    /// Wait until everything queued so far has been handed to the transport.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.outbound.send(Outbound::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// React to a membership change.
    ///
    /// A joining node is readmitted and its authored entries are pulled into
    /// `endpoint`. A departed node's entries are evicted; the evicted
    /// connections are returned.
    pub async fn handle_membership(
        &self,
        event: &MembershipEvent,
        endpoint: &dyn ReplicaEndpoint,
    ) -> Vec<Connection> {
        let local = self.transport.local_node();
        match event {
            MembershipEvent::Joined(node) if *node != local => {
                let known = {
                    let mut members = self.members();
                    members.insert(node.clone());
                    members.len()
                };
                self.health.set_known_members(known);
                self.replica.readmit(node);
                self.catch_up(node, endpoint).await;
                if self.resync.swap(false, Ordering::SeqCst) {
                    self.republish(endpoint.snapshot());
                }
                Vec::new()
            }
            MembershipEvent::Departed(node) if *node != local => {
                let known = {
                    let mut members = self.members();
                    members.remove(node);
                    members.len()
                };
                self.health.set_known_members(known);
                let evicted = self.replica.evict_origin(node);
                info!(
                    "Node {} departed, evicted {} entries",
                    node,
                    evicted.len()
                );
                evicted
            }
            _ => Vec::new(),
        }
    }

    async fn catch_up(&self, node: &NodeId, endpoint: &dyn ReplicaEndpoint) {
        let mut attempt = 1;
        let snapshot = loop {
            match self.request_snapshot(node).await {
                Err(e) if e.is_retryable() && attempt < ReplicationConfig::CATCH_UP_ATTEMPTS => {
                    debug!("Catch-up from {} failed (attempt {}): {}", node, attempt, e);
                    attempt += 1;
                    tokio::time::sleep(ReplicationConfig::CATCH_UP_RETRY_DELAY).await;
                }
                outcome => break outcome,
            }
        };

        match snapshot {
            Ok(entries) => {
                info!("Catching up {} entries from {}", entries.len(), node);
                for mutation in entries {
                    endpoint.apply(mutation);
                }
            }
            Err(e) => {
                warn!("Catch-up from {} failed: {}", node, e);
                self.health.record_failure(&e);
            }
        }
    }

    async fn request_snapshot(&self, node: &NodeId) -> Result<Vec<ReplicaMutation>> {
        tokio::time::timeout(
            ReplicationConfig::SNAPSHOT_TIMEOUT,
            self.transport.request_snapshot(node),
        )
        .await
        .unwrap_or_else(|_| {
            Err(LocationError::MembershipUnavailable {
                message: format!(
                    "snapshot from {} timed out after {:?}",
                    node,
                    ReplicationConfig::SNAPSHOT_TIMEOUT
                ),
            })
        })
    }

    /// Queue already merged mutations for another round of delivery.
    fn republish(&self, mutations: Vec<ReplicaMutation>) {
        info!("Re-broadcasting {} authored entries", mutations.len());
        for mutation in mutations {
            if self.outbound.send(Outbound::Mutation(mutation)).is_err() {
                break;
            }
        }
    }

    pub fn known_members(&self) -> Vec<NodeId> {
        self.members().iter().cloned().collect()
    }
}

impl Drop for Distributor {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComponentId, ComponentType, Location};
    use crate::replication::HealthStatus;
    use crate::transport::MemoryCluster;

    /// Merges into a cache and serves a fixed snapshot.
    struct CacheEndpoint {
        cache: Arc<ReplicaCache>,
        authored: Vec<ReplicaMutation>,
    }

    impl ReplicaEndpoint for CacheEndpoint {
        fn apply(&self, mutation: ReplicaMutation) {
            self.cache.merge(mutation);
        }

        fn snapshot(&self) -> Vec<ReplicaMutation> {
            self.authored.clone()
        }
    }

    fn service(name: &str, port: u16) -> Location {
        let id = ComponentId::new(name, ComponentType::Service).unwrap();
        Location::tcp(Connection::tcp(id), "10.0.0.1", port).unwrap()
    }

    fn distributor_for(transport: Arc<dyn Transport>) -> (Distributor, Arc<ReplicaCache>, Arc<HealthMonitor>) {
        let replica = Arc::new(ReplicaCache::new());
        let health = Arc::new(HealthMonitor::new());
        (
            Distributor::new(transport, replica.clone(), health.clone()),
            replica,
            health,
        )
    }

    #[tokio::test]
    async fn test_publish_merges_locally_and_reaches_peer() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("host-a");
        let b = cluster.join("host-b");
        let peer = Arc::new(CacheEndpoint {
            cache: Arc::new(ReplicaCache::new()),
            authored: Vec::new(),
        });
        b.bind(peer.clone());

        let (distributor, replica, health) = distributor_for(a.clone());
        let location = service("svc", 80);
        let outcome = distributor.publish(ReplicaMutation::live(location.clone(), a.local_node(), 1));
        assert!(outcome.is_applied());
        assert_eq!(replica.get(location.connection()), Some(location.clone()));

        distributor.flush().await;
        assert_eq!(peer.cache.get(location.connection()), Some(location));
        assert_eq!(health.current().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_stale_publish_is_not_broadcast() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("host-a");
        let b = cluster.join("host-b");
        let peer = Arc::new(CacheEndpoint {
            cache: Arc::new(ReplicaCache::new()),
            authored: Vec::new(),
        });
        b.bind(peer.clone());

        let (distributor, _replica, _health) = distributor_for(a.clone());
        let newer = service("svc", 81);
        distributor.publish(ReplicaMutation::live(newer.clone(), a.local_node(), 2));
        let outcome = distributor.publish(ReplicaMutation::live(service("svc", 80), a.local_node(), 1));
        assert_eq!(outcome, MergeOutcome::Stale);

        distributor.flush().await;
        assert_eq!(peer.cache.get(newer.connection()), Some(newer));
    }

    #[tokio::test]
    async fn test_isolated_broadcast_marks_health_isolated() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("host-a");
        let _b = cluster.join("host-b");
        cluster.isolate(&a.local_node());

        let (distributor, replica, health) = distributor_for(a.clone());
        let location = service("svc", 80);
        distributor.publish(ReplicaMutation::live(location.clone(), a.local_node(), 1));
        distributor.flush().await;

        assert_eq!(replica.get(location.connection()), Some(location));
        assert_eq!(health.current().status, HealthStatus::Isolated);
    }

    #[tokio::test]
    async fn test_join_pulls_snapshot_and_departure_evicts() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("host-a");
        let b = cluster.join("host-b");
        let remote = service("remote", 90);
        let serving = Arc::new(CacheEndpoint {
            cache: Arc::new(ReplicaCache::new()),
            authored: vec![ReplicaMutation::live(remote.clone(), b.local_node(), 4)],
        });
        b.bind(serving.clone());

        let (distributor, replica, health) = distributor_for(a.clone());
        let local = CacheEndpoint {
            cache: replica.clone(),
            authored: Vec::new(),
        };

        distributor
            .handle_membership(&MembershipEvent::Joined(b.local_node()), &local)
            .await;
        assert_eq!(replica.get(remote.connection()), Some(remote.clone()));
        assert_eq!(health.current().known_members, 1);

        let evicted = distributor
            .handle_membership(&MembershipEvent::Departed(b.local_node()), &local)
            .await;
        assert_eq!(evicted, vec![remote.connection().clone()]);
        assert!(replica.get(remote.connection()).is_none());
        assert!(replica.is_departed(&b.local_node()));
        assert_eq!(health.current().known_members, 0);

        distributor
            .handle_membership(&MembershipEvent::Joined(b.local_node()), &local)
            .await;
        assert!(!replica.is_departed(&b.local_node()));
        assert_eq!(replica.get(remote.connection()), Some(remote));
    }

    #[tokio::test]
    async fn test_missed_broadcast_is_resent_on_next_join() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("host-a");
        let b = cluster.join("host-b");
        let peer = Arc::new(CacheEndpoint {
            cache: Arc::new(ReplicaCache::new()),
            authored: Vec::new(),
        });
        b.bind(peer.clone());
        cluster.isolate(&a.local_node());

        let (distributor, _replica, _health) = distributor_for(a.clone());
        let location = service("svc", 80);
        let mutation = ReplicaMutation::live(location.clone(), a.local_node(), 1);
        distributor.publish(mutation.clone());
        distributor.flush().await;
        assert!(peer.cache.get(location.connection()).is_none());

        cluster.heal(&a.local_node());
        let local = CacheEndpoint {
            cache: Arc::new(ReplicaCache::new()),
            authored: vec![mutation],
        };
        distributor
            .handle_membership(&MembershipEvent::Joined(b.local_node()), &local)
            .await;
        distributor.flush().await;
        assert_eq!(peer.cache.get(location.connection()), Some(location));
    }

    #[tokio::test]
    async fn test_failed_catch_up_degrades_health() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("host-a");
        let b = cluster.join("host-b");
        cluster.isolate(&b.local_node());

        let (distributor, replica, health) = distributor_for(a.clone());
        let local = CacheEndpoint {
            cache: replica,
            authored: Vec::new(),
        };
        distributor
            .handle_membership(&MembershipEvent::Joined(b.local_node()), &local)
            .await;

        assert_ne!(health.current().status, HealthStatus::Healthy);
        assert!(health.current().last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_retries_transient_failure() {
        let cluster = MemoryCluster::new();
        let a = cluster.join("host-a");
        let b = cluster.join("host-b");
        let remote = service("remote", 90);
        b.bind(Arc::new(CacheEndpoint {
            cache: Arc::new(ReplicaCache::new()),
            authored: vec![ReplicaMutation::live(remote.clone(), b.local_node(), 1)],
        }));
        cluster.isolate(&b.local_node());

        let healer = cluster.clone();
        let b_node = b.local_node();
        tokio::spawn(async move {
            tokio::time::sleep(ReplicationConfig::CATCH_UP_RETRY_DELAY / 2).await;
            healer.heal(&b_node);
        });

        let (distributor, replica, health) = distributor_for(a.clone());
        let local = CacheEndpoint {
            cache: replica.clone(),
            authored: Vec::new(),
        };
        distributor
            .handle_membership(&MembershipEvent::Joined(b.local_node()), &local)
            .await;

        assert_eq!(replica.get(remote.connection()), Some(remote));
        assert_eq!(health.current().status, HealthStatus::Healthy);
    }
}
