//! Connections: the typed registry key.

use serde::{Deserialize, Serialize};

use super::component::{ComponentId, ComponentType};
use crate::error::{LocationError, Result};

/// How a component endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Agent,
    Http,
    Tcp,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Agent => "agent",
            ConnectionType::Http => "http",
            ConnectionType::Tcp => "tcp",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "agent" => Some(ConnectionType::Agent),
            "http" => Some(ConnectionType::Http),
            "tcp" => Some(ConnectionType::Tcp),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A component identity plus the kind of endpoint it exposes.
///
/// Two connections are equal iff both the component id and the connection
/// type are equal. The key encoding `name-componenttype-connectiontype` is
/// parsed from the right, so component names may themselves contain `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub component_id: ComponentId,
    pub connection_type: ConnectionType,
}

impl Connection {
    pub fn new(component_id: ComponentId, connection_type: ConnectionType) -> Self {
        Self {
            component_id,
            connection_type,
        }
    }

    pub fn agent(component_id: ComponentId) -> Self {
        Self::new(component_id, ConnectionType::Agent)
    }

    pub fn http(component_id: ComponentId) -> Self {
        Self::new(component_id, ConnectionType::Http)
    }

    pub fn tcp(component_id: ComponentId) -> Self {
        Self::new(component_id, ConnectionType::Tcp)
    }

    pub fn name(&self) -> &str {
        &self.component_id.name
    }

    pub fn component_type(&self) -> ComponentType {
        self.component_id.component_type
    }

    /// Stable string key used in logs and on the wire.
    pub fn key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.component_id.name, self.component_id.component_type, self.connection_type
        )
    }

    /// Parse a key produced by [`Connection::key`].
    pub fn from_key(key: &str) -> Result<Self> {
        let mut parts = key.rsplitn(3, '-');
        let (Some(connection_type), Some(component_type), Some(name)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(LocationError::malformed(format!(
                "connection key '{}' must look like name-componenttype-connectiontype",
                key
            )));
        };

        let connection_type = ConnectionType::from_str(connection_type).ok_or_else(|| {
            LocationError::malformed(format!("unknown connection type '{}'", connection_type))
        })?;
        let component_type = ComponentType::from_str(component_type).ok_or_else(|| {
            LocationError::malformed(format!("unknown component type '{}'", component_type))
        })?;
        let component_id = ComponentId::new(name, component_type)
            .map_err(|e| LocationError::malformed(e.to_string()))?;

        Ok(Self::new(component_id, connection_type))
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}
