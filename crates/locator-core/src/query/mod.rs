//! Resolution and filtering over the replica cache.
//!
//! Exact resolution lives on [`crate::LocationService`] because it consults the
//! local registry first; this module holds the stateless pieces it builds on.

mod filter;
mod tracker;

pub use filter::LocationFilter;
pub use tracker::LocationTracker;
