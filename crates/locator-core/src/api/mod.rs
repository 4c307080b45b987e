//! API implementation submodules.
//!
//! Each submodule contains `impl LocationService` blocks that extend the
//! public API. The struct definition remains in `lib.rs`.

mod builder;
mod query;
mod registration;
mod state;

pub use builder::LocationServiceBuilder;
pub(crate) use state::NodeState;
