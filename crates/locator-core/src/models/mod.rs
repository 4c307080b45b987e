//! Identity and value types for the registry.
//!
//! - [`ComponentId`] / [`ComponentType`]: who a component is
//! - [`Connection`] / [`ConnectionType`]: the typed key components register under
//! - [`Location`]: where a connection can currently be reached
//!
//! All types are immutable values with structural equality.

mod component;
mod connection;
mod location;
mod node;
mod registration;

pub use component::{ComponentId, ComponentType};
pub use connection::{Connection, ConnectionType};
pub use location::{AgentLocation, AgentRef, HttpLocation, Location, TcpLocation};
pub use node::NodeId;
pub use registration::{LocationUpdate, RegistrationResult};
