//! Centralized configuration for the location registry.
//!
//! Constants for replication, membership probing and the TCP IPC layer.

use std::time::Duration;

/// Replication and query configuration.
pub struct ReplicationConfig;

impl ReplicationConfig {
    /// Capacity of the per-process change feed backing `track`.
    pub const CHANGE_FEED_CAPACITY: usize = 256;
    /// Upper bound on a single catch-up snapshot request.
    pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default wait used by `resolve` callers that don't pass their own.
    pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
    /// How long a departed node's late mutations keep being refused.
    pub const DEPARTED_RETENTION: Duration = Duration::from_secs(600);
    /// Snapshot requests per join before giving up on a transient failure.
    pub const CATCH_UP_ATTEMPTS: u32 = 3;
    pub const CATCH_UP_RETRY_DELAY: Duration = Duration::from_millis(200);
}

/// Cluster membership probing (TCP transport).
pub struct MembershipConfig;

impl MembershipConfig {
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);
    /// Consecutive missed heartbeats before a peer is reported as departed.
    pub const DEPARTURE_THRESHOLD: u32 = 4;
}

/// IPC framing and connection limits.
pub struct IpcConfig;

impl IpcConfig {
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 64;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);
}
