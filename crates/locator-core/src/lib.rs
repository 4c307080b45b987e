//! Locator Core - embeddable distributed location registry.
//!
//! Components register the endpoints they can be reached at (an agent
//! reference, an HTTP endpoint or a TCP endpoint) under a typed
//! [`Connection`], and any node in the cluster can resolve, list or track
//! those registrations. Each node keeps a replica of the whole registry,
//! merged from versioned mutations, so reads never leave the process.
//!
//! # Example
//!
//! ```rust,ignore
//! use locator_core::{ComponentId, ComponentType, Connection, Location, LocationService, MemoryCluster};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> locator_core::Result<()> {
//!     let cluster = MemoryCluster::new();
//!     let service = LocationService::builder(cluster.join("localhost")).build().await?;
//!
//!     let id = ComponentId::new("exampleTcpService", ComponentType::Service)?;
//!     let location = Location::tcp(Connection::tcp(id), "10.0.0.5", 1234)?;
//!     service.register(location.clone()).await?;
//!
//!     let found = service.resolve(location.connection(), Duration::from_secs(1)).await;
//!     println!("Resolved: {:?}", found);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod liveness;
pub mod models;
pub mod query;
pub mod registry;
pub mod replication;
pub mod transport;

mod api;

// Re-export commonly used types
pub use error::{LocationError, Result};
pub use models::{
    AgentLocation, AgentRef, ComponentId, ComponentType, Connection, ConnectionType,
    HttpLocation, Location, LocationUpdate, NodeId, RegistrationResult, TcpLocation,
};
pub use query::{LocationFilter, LocationTracker};
pub use replication::{HealthReport, HealthStatus};
pub use transport::{
    AgentHandle, MembershipEvent, MemoryCluster, MemoryTransport, TcpTransport,
    TcpTransportConfig, Transport,
};

pub use api::LocationServiceBuilder;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use api::NodeState;

/// One node of the location registry.
///
/// Registrations made here are owned by this node and replicated to every
/// other member reachable through the transport. Queries are answered from
/// the local replica.
pub struct LocationService {
    state: Arc<NodeState>,
    default_resolve_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocationService {
    /// Create a builder bound to `transport`.
    ///
    /// ```rust,ignore
    /// let service = LocationService::builder(transport)
    ///     .watch_replicas(false)
    ///     .build()
    ///     .await?;
    /// ```
    pub fn builder(transport: Arc<dyn Transport>) -> LocationServiceBuilder {
        LocationServiceBuilder::new(transport)
    }

    /// Create a service with default options.
    pub async fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(transport).build().await
    }

    pub fn node_id(&self) -> NodeId {
        self.state.node().clone()
    }

    /// Peers this node currently exchanges mutations with.
    pub fn members(&self) -> Vec<NodeId> {
        self.state.distributor.known_members()
    }

    /// Current replication health.
    pub fn health(&self) -> HealthReport {
        self.state.health.current()
    }

    /// Receiver that changes whenever replication health does.
    pub fn watch_health(&self) -> watch::Receiver<HealthReport> {
        self.state.health.subscribe()
    }

    /// Create an agent hosted on this node, suitable for agent locations.
    pub fn spawn_agent(&self, name: &str) -> AgentHandle {
        self.state.transport.spawn_agent(name)
    }

    pub fn is_running(&self) -> bool {
        !self.state.is_stopped()
    }

    /// Unregister everything owned here and stop background work.
    ///
    /// Pending broadcasts are handed to the transport before returning.
    /// Returns the number of entries withdrawn; later calls return 0.
    pub async fn shutdown(&self) -> usize {
        if self.state.stopped.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let withdrawn = self.state.withdraw_all();
        self.state.distributor.flush().await;
        self.abort_tasks();
        self.state.watcher.clear();

        info!(
            "Location service on {} shut down, withdrew {} entries",
            self.state.node(),
            withdrawn
        );
        withdrawn
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for LocationService {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_service_creation() {
        let cluster = MemoryCluster::new();
        let transport = cluster.join("localhost");
        let service = LocationService::new(transport.clone()).await.unwrap();

        assert_eq!(service.node_id(), transport.local_node());
        assert_eq!(service.health().status, HealthStatus::Healthy);
        assert!(service.is_running());
    }

    #[tokio::test]
    async fn test_zero_default_timeout_rejected() {
        let cluster = MemoryCluster::new();
        let result = LocationService::builder(cluster.join("localhost"))
            .default_resolve_timeout(Duration::ZERO)
            .build()
            .await;
        assert!(matches!(result, Err(LocationError::Config { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_withdraws_and_stops() {
        let cluster = MemoryCluster::new();
        let service = LocationService::new(cluster.join("localhost")).await.unwrap();
        let id = ComponentId::new("svc", ComponentType::Service).unwrap();
        let location = Location::tcp(Connection::tcp(id), "10.0.0.1", 80).unwrap();
        service.register(location.clone()).await.unwrap();

        assert_eq!(service.shutdown().await, 1);
        assert_eq!(service.shutdown().await, 0);
        assert!(service.list().await.is_empty());
        assert!(matches!(
            service.register(location).await,
            Err(LocationError::ServiceStopped)
        ));
    }
}
