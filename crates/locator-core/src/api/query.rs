//! Resolution and listing methods for LocationService.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{LocationError, Result};
use crate::models::{ComponentType, Connection, ConnectionType, Location};
use crate::query::{LocationFilter, LocationTracker};
use crate::LocationService;

impl LocationService {
    // ========================================
    // Resolution
    // ========================================

    /// Resolve a connection, waiting up to `within` for it to be registered.
    ///
    /// A zero `within` only looks at current state. Returns `None` when
    /// nothing was registered in time.
    pub async fn resolve(&self, connection: &Connection, within: Duration) -> Option<Location> {
        let state = &self.state;
        if let Some(location) = state.registry.get(connection) {
            return Some(location);
        }
        if within.is_zero() || state.is_stopped() {
            return state.replica.get(connection);
        }

        let waiter = match state.replica.get_or_wait(connection) {
            Ok(location) => return Some(location),
            Err(waiter) => waiter,
        };

        match tokio::time::timeout(within, waiter).await {
            Ok(Ok(location)) => Some(location),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!("Resolving {} timed out after {:?}", connection, within);
                None
            }
        }
    }

    /// Resolve within the configured default timeout, or fail.
    pub async fn resolve_required(&self, connection: &Connection) -> Result<Location> {
        self.state.ensure_running()?;
        let timeout = self.default_resolve_timeout;
        self.resolve(connection, timeout)
            .await
            .ok_or_else(|| LocationError::ResolutionTimeout {
                connection: connection.key(),
                timeout,
            })
    }

    // ========================================
    // Listing
    // ========================================

    /// Every live location in the cluster, in registration order.
    pub async fn list(&self) -> Vec<Location> {
        self.list_filtered(&LocationFilter::All).await
    }

    pub async fn list_by_component_type(&self, component_type: ComponentType) -> Vec<Location> {
        self.list_filtered(&LocationFilter::ComponentType(component_type))
            .await
    }

    pub async fn list_by_connection_type(&self, connection_type: ConnectionType) -> Vec<Location> {
        self.list_filtered(&LocationFilter::ConnectionType(connection_type))
            .await
    }

    /// Locations whose host is exactly `hostname`.
    pub async fn list_by_hostname(&self, hostname: &str) -> Vec<Location> {
        self.list_filtered(&LocationFilter::Hostname(hostname.to_string()))
            .await
    }

    pub async fn list_filtered(&self, filter: &LocationFilter) -> Vec<Location> {
        self.state.replica.list(filter)
    }

    // ========================================
    // Tracking
    // ========================================

    /// Follow changes to one connection.
    ///
    /// The current location, if any, is emitted first.
    pub async fn track(&self, connection: &Connection) -> Result<LocationTracker> {
        self.state.ensure_running()?;
        Ok(LocationTracker::new(
            Arc::clone(&self.state.replica),
            connection.clone(),
        ))
    }
}
