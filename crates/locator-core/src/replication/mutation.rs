//! Replicated mutations and their wire format.
//!
//! ```text
//! {"connection": "hcd1-hcd-agent",
//!  "location": {"type": "agent", "node": "...", "host": "...", "path": "..."} | null,
//!  "origin": "<node id>",
//!  "version": 7}
//! ```
//!
//! A `null` location is a tombstone.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{LocationError, Result};
use crate::models::{
    AgentLocation, AgentRef, Connection, ConnectionType, HttpLocation, Location, NodeId,
    TcpLocation,
};

/// What a mutation does to its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationPayload {
    Live(Location),
    Tombstone,
}

/// One versioned insert or removal authored by `origin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaMutation {
    pub connection: Connection,
    pub payload: MutationPayload,
    pub origin: NodeId,
    pub version: u64,
}

impl ReplicaMutation {
    pub fn live(location: Location, origin: NodeId, version: u64) -> Self {
        Self {
            connection: location.connection().clone(),
            payload: MutationPayload::Live(location),
            origin,
            version,
        }
    }

    pub fn tombstone(connection: Connection, origin: NodeId, version: u64) -> Self {
        Self {
            connection,
            payload: MutationPayload::Tombstone,
            origin,
            version,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.payload, MutationPayload::Tombstone)
    }

    pub fn location(&self) -> Option<&Location> {
        match &self.payload {
            MutationPayload::Live(location) => Some(location),
            MutationPayload::Tombstone => None,
        }
    }

    /// Total order used by the merge rule: version first, origin breaks ties.
    pub fn order_key(&self) -> (u64, &NodeId) {
        (self.version, &self.origin)
    }

    pub fn to_wire(&self) -> WireMutation {
        let location = match &self.payload {
            MutationPayload::Tombstone => None,
            MutationPayload::Live(Location::Agent(l)) => Some(WireLocation::Agent {
                node: l.reference.node.clone(),
                host: l.reference.host.clone(),
                path: l.reference.path.clone(),
            }),
            MutationPayload::Live(Location::Http(l)) => Some(WireLocation::Http {
                host: l.host.clone(),
                port: l.port,
                path: l.path.clone(),
            }),
            MutationPayload::Live(Location::Tcp(l)) => Some(WireLocation::Tcp {
                host: l.host.clone(),
                port: l.port,
            }),
        };

        WireMutation {
            connection: self.connection.key(),
            location,
            origin: self.origin.clone(),
            version: self.version,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.to_wire())?)
    }

    /// Decode a JSON value, rejecting unknown tags instead of dropping fields.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let wire: WireMutation = serde_json::from_value(value)
            .map_err(|e| LocationError::malformed(format!("undecodable mutation: {}", e)))?;
        wire.decode()
    }
}

/// Compare two `(version, origin)` keys.
pub(crate) fn compare_keys(a: (u64, &NodeId), b: (u64, &NodeId)) -> Ordering {
    a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1))
}

/// Serialized form of a [`ReplicaMutation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireMutation {
    pub connection: String,
    pub location: Option<WireLocation>,
    pub origin: NodeId,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum WireLocation {
    Agent {
        node: NodeId,
        host: String,
        path: String,
    },
    Http {
        host: String,
        port: u16,
        path: String,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

impl WireLocation {
    fn connection_type(&self) -> ConnectionType {
        match self {
            WireLocation::Agent { .. } => ConnectionType::Agent,
            WireLocation::Http { .. } => ConnectionType::Http,
            WireLocation::Tcp { .. } => ConnectionType::Tcp,
        }
    }
}

impl WireMutation {
    pub fn decode(self) -> Result<ReplicaMutation> {
        let connection = Connection::from_key(&self.connection)?;

        let payload = match self.location {
            None => MutationPayload::Tombstone,
            Some(wire) => {
                if wire.connection_type() != connection.connection_type {
                    return Err(LocationError::malformed(format!(
                        "{} payload does not match connection {}",
                        wire.connection_type(),
                        connection
                    )));
                }
                let connection = connection.clone();
                let location = match wire {
                    WireLocation::Agent { node, host, path } => Location::Agent(AgentLocation {
                        connection,
                        reference: AgentRef { node, host, path },
                    }),
                    WireLocation::Http { host, port, path } => Location::Http(HttpLocation {
                        connection,
                        host,
                        port,
                        path,
                    }),
                    WireLocation::Tcp { host, port } => {
                        Location::Tcp(TcpLocation { connection, host, port })
                    }
                };
                MutationPayload::Live(location)
            }
        };

        Ok(ReplicaMutation {
            connection,
            payload,
            origin: self.origin,
            version: self.version,
        })
    }
}
