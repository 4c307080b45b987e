//! Local authoritative registry.
//!
//! Holds the entries registered through this process together with the
//! per-connection version counters used to order replicated mutations.
//! Reads on other nodes go through the replica cache instead.

pub mod local_registry;

pub use local_registry::{LocalRegistry, OwnedEntry, Registration};
