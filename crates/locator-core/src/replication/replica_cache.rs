//! Per-process replica of the cluster-wide registry.
//!
//! The cache is the read path for every query. It is mutated only by the
//! merge path (local writes and remote mutations) under a single write lock,
//! which also wakes pending resolvers and feeds the change stream.

use indexmap::IndexMap;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::debug;

use super::mutation::{compare_keys, MutationPayload, ReplicaMutation};
use crate::config::ReplicationConfig;
use crate::models::{Connection, Location, LocationUpdate, NodeId};
use crate::query::LocationFilter;

/// Stored state for one connection. A `None` location is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSlot {
    pub location: Option<Location>,
    pub origin: NodeId,
    pub version: u64,
    /// Live copy dropped locally after its agent terminated. The same
    /// `(version, origin)` delivered live again restores it.
    pub reclaimed: bool,
}

impl ReplicaSlot {
    fn key(&self) -> (u64, &NodeId) {
        (self.version, &self.origin)
    }
}

/// Result of merging one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The mutation replaced the stored slot.
    Applied { previous: Option<Location> },
    /// An equal or newer slot is already stored.
    Stale,
    /// The origin has departed and is not accepted until it rejoins.
    Rejected,
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied { .. })
    }
}

#[derive(Default)]
struct CacheState {
    slots: IndexMap<Connection, ReplicaSlot>,
    waiters: HashMap<Connection, Vec<oneshot::Sender<Location>>>,
    /// Departed origins and when they left.
    departed: HashMap<NodeId, Instant>,
}

impl CacheState {
    /// Forget departures older than the retention window. A node that comes
    /// back after that is accepted again without a `readmit`.
    fn prune_departed(&mut self, now: Instant) {
        self.departed
            .retain(|_, since| now.saturating_duration_since(*since) < ReplicationConfig::DEPARTED_RETENTION);
    }

    fn is_departed(&self, node: &NodeId, now: Instant) -> bool {
        self.departed
            .get(node)
            .is_some_and(|since| now.saturating_duration_since(*since) < ReplicationConfig::DEPARTED_RETENTION)
    }
}

/// Read-optimized mirror of every live node's local registry.
pub struct ReplicaCache {
    state: RwLock<CacheState>,
    changes: broadcast::Sender<LocationUpdate>,
}

impl Default for ReplicaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaCache {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(ReplicationConfig::CHANGE_FEED_CAPACITY);
        Self {
            state: RwLock::new(CacheState::default()),
            changes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge a mutation using the `(version, origin)` rule.
    ///
    /// A tombstone carrying the same key as a stored live slot wins, so the
    /// outcome does not depend on delivery order or duplication.
    pub fn merge(&self, mutation: ReplicaMutation) -> MergeOutcome {
        let mut state = self.write();

        if state.is_departed(&mutation.origin, Instant::now()) {
            debug!(
                "Rejecting {} from departed node {}",
                mutation.connection, mutation.origin
            );
            return MergeOutcome::Rejected;
        }

        if let Some(slot) = state.slots.get(&mutation.connection) {
            let accept = match compare_keys(mutation.order_key(), slot.key()) {
                Ordering::Greater => true,
                Ordering::Equal if mutation.is_tombstone() => slot.location.is_some(),
                Ordering::Equal => slot.reclaimed,
                Ordering::Less => false,
            };
            if !accept {
                return MergeOutcome::Stale;
            }
        }

        let ReplicaMutation {
            connection,
            payload,
            origin,
            version,
        } = mutation;

        let previous = state
            .slots
            .shift_remove(&connection)
            .and_then(|slot| slot.location);

        let location = match payload {
            MutationPayload::Live(location) => Some(location),
            MutationPayload::Tombstone => None,
        };

        debug!(
            "Merged {} v{} from {} ({})",
            connection,
            version,
            origin,
            if location.is_some() { "live" } else { "tombstone" }
        );

        match (&previous, &location) {
            (_, Some(current)) if previous.as_ref() != Some(current) => {
                self.publish(LocationUpdate::Updated(current.clone()));
            }
            (Some(_), None) => {
                self.publish(LocationUpdate::Removed(connection.clone()));
            }
            _ => {}
        }

        if let Some(current) = &location {
            if let Some(waiters) = state.waiters.remove(&connection) {
                for waiter in waiters {
                    let _ = waiter.send(current.clone());
                }
            }
        }

        state.slots.insert(
            connection,
            ReplicaSlot {
                location,
                origin,
                version,
                reclaimed: false,
            },
        );

        MergeOutcome::Applied { previous }
    }

    fn publish(&self, update: LocationUpdate) {
        // No receivers is the common case outside of `track`.
        let _ = self.changes.send(update);
    }

    pub fn get(&self, connection: &Connection) -> Option<Location> {
        self.read()
            .slots
            .get(connection)
            .and_then(|slot| slot.location.clone())
    }

    pub fn slot(&self, connection: &Connection) -> Option<ReplicaSlot> {
        self.read().slots.get(connection).cloned()
    }

    /// Highest version seen for a connection, tombstones included.
    pub fn version_of(&self, connection: &Connection) -> Option<u64> {
        self.read().slots.get(connection).map(|slot| slot.version)
    }

    pub fn list(&self, filter: &LocationFilter) -> Vec<Location> {
        self.read()
            .slots
            .values()
            .filter_map(|slot| slot.location.as_ref())
            .filter(|location| filter.matches(location))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read()
            .slots
            .values()
            .filter(|slot| slot.location.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the current location, or register a waiter woken by the merge path.
    ///
    /// Check and registration happen under the same lock, so a merge can't
    /// slip in between them.
    pub fn get_or_wait(
        &self,
        connection: &Connection,
    ) -> Result<Location, oneshot::Receiver<Location>> {
        let mut state = self.write();
        if let Some(location) = state
            .slots
            .get(connection)
            .and_then(|slot| slot.location.clone())
        {
            return Ok(location);
        }

        // Resolvers that timed out leave closed senders behind.
        state.waiters.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });

        let (tx, rx) = oneshot::channel();
        state.waiters.entry(connection.clone()).or_default().push(tx);
        Err(rx)
    }

    /// Drop the live copy of a slot authored elsewhere, without a broadcast.
    ///
    /// Used when this node observes termination of a remote entry's agent.
    /// Only applies if the slot still carries `version`. The slot keeps its
    /// key, so older writes stay rejected, but unlike a tombstone the same
    /// live write delivered again (by catch-up) brings the entry back.
    pub fn reclaim(&self, connection: &Connection, origin: &NodeId, version: u64) -> bool {
        let mut state = self.write();
        let Some(slot) = state.slots.get_mut(connection) else {
            return false;
        };
        if slot.location.is_none() || slot.version != version || &slot.origin != origin {
            return false;
        }
        slot.location = None;
        slot.reclaimed = true;
        debug!("Reclaimed {} v{} from {}", connection, version, origin);
        self.publish(LocationUpdate::Removed(connection.clone()));
        true
    }

    /// Forget everything authored by a departed node and refuse its mutations
    /// until [`ReplicaCache::readmit`] is called.
    ///
    /// Returns the connections whose live entries were removed.
    pub fn evict_origin(&self, node: &NodeId) -> Vec<Connection> {
        let mut state = self.write();
        let now = Instant::now();
        state.prune_departed(now);
        state.departed.insert(node.clone(), now);

        let mut removed = Vec::new();
        state.slots.retain(|connection, slot| {
            if &slot.origin != node {
                return true;
            }
            if slot.location.is_some() {
                removed.push(connection.clone());
            }
            false
        });

        for connection in &removed {
            self.publish(LocationUpdate::Removed(connection.clone()));
        }
        removed
    }

    /// Accept mutations from a node again.
    pub fn readmit(&self, node: &NodeId) -> bool {
        let mut state = self.write();
        state.prune_departed(Instant::now());
        state.departed.remove(node).is_some()
    }

    pub fn is_departed(&self, node: &NodeId) -> bool {
        self.read().is_departed(node, Instant::now())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LocationUpdate> {
        self.changes.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    #[cfg(test)]
    pub(crate) fn waiting_connections(&self) -> usize {
        self.read().waiters.len()
    }

    #[cfg(test)]
    pub(crate) fn departed_count(&self) -> usize {
        self.read().departed.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_waiters(&self) -> usize {
        self.read()
            .waiters
            .values()
            .flatten()
            .filter(|w| !w.is_closed())
            .count()
    }
}
