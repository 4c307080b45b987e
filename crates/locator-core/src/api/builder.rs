//! Builder for configuring LocationService initialization.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use crate::api::state::{self, NodeState};
use crate::config::ReplicationConfig;
use crate::error::{LocationError, Result};
use crate::liveness::LivenessWatcher;
use crate::registry::LocalRegistry;
use crate::replication::{Distributor, HealthMonitor, ReplicaCache};
use crate::transport::Transport;
use crate::LocationService;

/// Builder for configuring LocationService initialization.
///
/// # Example
///
/// ```rust,ignore
/// use locator_core::{LocationService, MemoryCluster};
///
/// let cluster = MemoryCluster::new();
/// let service = LocationService::builder(cluster.join("localhost"))
///     .default_resolve_timeout(Duration::from_secs(2))
///     .build()
///     .await?;
/// ```
pub struct LocationServiceBuilder {
    transport: Arc<dyn Transport>,
    default_resolve_timeout: Duration,
    watch_replicas: bool,
}

impl LocationServiceBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            default_resolve_timeout: ReplicationConfig::DEFAULT_RESOLVE_TIMEOUT,
            watch_replicas: true,
        }
    }

    /// How long `resolve_required` waits for a connection to appear.
    ///
    /// Default: [`ReplicationConfig::DEFAULT_RESOLVE_TIMEOUT`]
    pub fn default_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.default_resolve_timeout = timeout;
        self
    }

    /// Also watch agents behind entries registered on other nodes.
    ///
    /// When enabled, a dead remote agent disappears from this node's view
    /// without waiting for its origin to broadcast the removal.
    ///
    /// Default: `true`
    pub fn watch_replicas(mut self, enable: bool) -> Self {
        self.watch_replicas = enable;
        self
    }

    /// Bind to the transport and start the background loops.
    pub async fn build(self) -> Result<LocationService> {
        if self.default_resolve_timeout.is_zero() {
            return Err(LocationError::Config {
                message: "default_resolve_timeout must be greater than zero".to_string(),
            });
        }

        let transport = self.transport;
        let node = transport.local_node();
        let replica = Arc::new(ReplicaCache::new());
        let health = Arc::new(HealthMonitor::new());
        let (watcher, terminations) = LivenessWatcher::new(transport.clone());
        let distributor = Distributor::new(transport.clone(), replica.clone(), health.clone());

        let state = Arc::new(NodeState {
            registry: LocalRegistry::new(node.clone()),
            transport: transport.clone(),
            replica,
            watcher,
            distributor,
            health,
            watch_replicas: self.watch_replicas,
            stopped: AtomicBool::new(false),
        });

        // Bind before subscribing so nothing broadcast after catch-up is missed.
        transport.bind(state.clone());
        let membership = transport.membership_events();

        let tasks = vec![
            tokio::spawn(state::reap_terminations(
                Arc::downgrade(&state),
                terminations,
            )),
            tokio::spawn(state::follow_membership(
                Arc::downgrade(&state),
                membership,
            )),
        ];

        info!(
            "Location service started on node {} ({})",
            node,
            transport.local_host()
        );

        Ok(LocationService {
            state,
            default_resolve_timeout: self.default_resolve_timeout,
            tasks: Mutex::new(tasks),
        })
    }
}
