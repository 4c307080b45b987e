//! Cross-process distribution of registry state.
//!
//! Every node keeps a [`ReplicaCache`] that mirrors the union of all live
//! nodes' local registries. Local writes are merged into the cache right
//! away and pushed to peers by the [`Distributor`]; peers merge them under
//! the same `(version, origin)` rule, so replicas converge regardless of
//! delivery order.

mod distributor;
mod health;
mod mutation;
mod replica_cache;

pub use distributor::Distributor;
pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use mutation::{MutationPayload, ReplicaMutation, WireLocation, WireMutation};
pub use replica_cache::{MergeOutcome, ReplicaCache, ReplicaSlot};
