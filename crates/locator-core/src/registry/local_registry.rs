//! Per-process authoritative registry of locations registered through this node.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::{LocationError, Result};
use crate::models::{Connection, Location, NodeId, RegistrationResult};
use crate::replication::ReplicaMutation;

/// An entry owned by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedEntry {
    pub location: Location,
    pub version: u64,
}

/// Outcome of a successful [`LocalRegistry::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub result: RegistrationResult,
    /// `None` when the identical location was already registered.
    pub mutation: Option<ReplicaMutation>,
}

#[derive(Default)]
struct RegistryState {
    entries: IndexMap<Connection, OwnedEntry>,
    /// Last version minted per connection, kept after removal so that
    /// re-registration always produces a newer version.
    versions: HashMap<Connection, u64>,
}

impl RegistryState {
    fn mint(&mut self, connection: &Connection, observed: Option<u64>) -> u64 {
        let current = self.versions.get(connection).copied().unwrap_or(0);
        let next = current.max(observed.unwrap_or(0)) + 1;
        self.versions.insert(connection.clone(), next);
        next
    }
}

/// Single-writer map from connection to location for entries authored here.
///
/// Every write returns the [`ReplicaMutation`] the caller must merge locally
/// and hand to the distributor; the registry itself never talks to peers.
pub struct LocalRegistry {
    node: NodeId,
    state: RwLock<RegistryState>,
}

impl LocalRegistry {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================
    // Writes
    // ========================================

    /// Register a location.
    ///
    /// `observed` is the highest version the replica cache has seen for the
    /// connection; the minted version is always above it.
    pub fn register(&self, location: Location, observed: Option<u64>) -> Result<Registration> {
        location.validate()?;
        let result = RegistrationResult::for_location(&location);
        let connection = location.connection().clone();

        let mut state = self.write();
        if let Some(existing) = state.entries.get(&connection) {
            if existing.location == location {
                debug!("Idempotent re-registration of {}", connection);
                return Ok(Registration {
                    result,
                    mutation: None,
                });
            }
            return Err(LocationError::AlreadyRegistered {
                connection: connection.key(),
                existing: Box::new(existing.location.clone()),
            });
        }

        let version = state.mint(&connection, observed);
        state.entries.insert(
            connection.clone(),
            OwnedEntry {
                location: location.clone(),
                version,
            },
        );
        debug!("Registered {} v{} on {}", connection, version, self.node);

        Ok(Registration {
            result,
            mutation: Some(ReplicaMutation::live(location, self.node.clone(), version)),
        })
    }

    /// Remove an entry, returning whether it was owned here plus the tombstone
    /// to broadcast.
    ///
    /// `observed_live` is the version of a live replica slot for the
    /// connection, if one exists. The tombstone is produced even for absent
    /// keys, but when nothing live is known it carries version 0: it never
    /// outranks a write this node has not seen and is not remembered for
    /// snapshots.
    pub fn unregister(
        &self,
        connection: &Connection,
        observed_live: Option<u64>,
    ) -> (bool, ReplicaMutation) {
        let mut state = self.write();
        let removed = state.entries.shift_remove(connection).is_some();
        if !removed && observed_live.is_none() {
            debug!("Unregister of unknown {}", connection);
            return (
                false,
                ReplicaMutation::tombstone(connection.clone(), self.node.clone(), 0),
            );
        }
        let version = state.mint(connection, observed_live);
        if removed {
            debug!("Unregistered {} v{}", connection, version);
        }
        (
            removed,
            ReplicaMutation::tombstone(connection.clone(), self.node.clone(), version),
        )
    }

    /// Remove an entry only if it still carries `version`.
    ///
    /// Used by the liveness reaper so a stale termination never removes a
    /// later registration of the same connection.
    pub fn unregister_if_version(
        &self,
        connection: &Connection,
        version: u64,
    ) -> Option<ReplicaMutation> {
        let mut state = self.write();
        match state.entries.get(connection) {
            Some(entry) if entry.version == version => {}
            _ => return None,
        }
        state.entries.shift_remove(connection);
        let tombstone_version = state.mint(connection, None);
        debug!(
            "Reaped {} v{} (tombstone v{})",
            connection, version, tombstone_version
        );
        Some(ReplicaMutation::tombstone(
            connection.clone(),
            self.node.clone(),
            tombstone_version,
        ))
    }

    /// Remove every owned entry, one tombstone each.
    pub fn unregister_all(&self) -> Vec<ReplicaMutation> {
        let mut state = self.write();
        let connections: Vec<Connection> = state.entries.keys().cloned().collect();
        state.entries.clear();

        let tombstones: Vec<ReplicaMutation> = connections
            .into_iter()
            .map(|connection| {
                let version = state.mint(&connection, None);
                ReplicaMutation::tombstone(connection, self.node.clone(), version)
            })
            .collect();

        debug!("Unregistered all {} entries on {}", tombstones.len(), self.node);
        tombstones
    }

    /// Give up ownership when another node wrote a newer version of the key.
    ///
    /// Returns the dropped entry, if any.
    pub fn supersede(
        &self,
        connection: &Connection,
        version: u64,
        origin: &NodeId,
    ) -> Option<OwnedEntry> {
        if origin == &self.node {
            return None;
        }
        let mut state = self.write();
        let newer = match state.entries.get(connection) {
            Some(entry) => (version, origin) > (entry.version, &self.node),
            None => false,
        };
        if !newer {
            return None;
        }
        let dropped = state.entries.shift_remove(connection);
        let counter = state.versions.entry(connection.clone()).or_insert(0);
        *counter = (*counter).max(version);
        debug!("{} superseded by {} v{}", connection, origin, version);
        dropped
    }

    // ========================================
    // Reads
    // ========================================

    pub fn get(&self, connection: &Connection) -> Option<Location> {
        self.read()
            .entries
            .get(connection)
            .map(|entry| entry.location.clone())
    }

    #[cfg(test)]
    pub(crate) fn entry(&self, connection: &Connection) -> Option<OwnedEntry> {
        self.read().entries.get(connection).cloned()
    }

    /// Everything this node has authored: live entries plus tombstones for
    /// connections it removed.
    pub fn snapshot(&self) -> Vec<ReplicaMutation> {
        let state = self.read();
        let mut mutations: Vec<ReplicaMutation> = state
            .entries
            .values()
            .map(|entry| {
                ReplicaMutation::live(entry.location.clone(), self.node.clone(), entry.version)
            })
            .collect();

        mutations.extend(
            state
                .versions
                .iter()
                .filter(|(connection, _)| !state.entries.contains_key(*connection))
                .map(|(connection, version)| {
                    ReplicaMutation::tombstone(connection.clone(), self.node.clone(), *version)
                }),
        );
        mutations
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
