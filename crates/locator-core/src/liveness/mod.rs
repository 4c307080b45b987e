//! Liveness watching for agent-addressed locations.
//!
//! Every registered location that carries an [`AgentRef`](crate::models::AgentRef)
//! gets a termination watch through the transport. When the agent dies, the
//! owning node reaps its entry and broadcasts the tombstone; other nodes only
//! drop their replica copy and leave authoring the removal to the origin.

mod watcher;

pub use watcher::{LivenessWatcher, TerminationEvent, WatchScope, WatchState};
