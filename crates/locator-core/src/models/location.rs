//! Locations: where a connection can currently be reached.

use serde::{Deserialize, Serialize};
use url::Url;

use super::component::ComponentType;
use super::connection::{Connection, ConnectionType};
use super::node::NodeId;
use crate::error::{LocationError, Result};

/// Opaque handle to a live agent hosted by some node.
///
/// Liveness of the agent is only observable through the transport's
/// termination subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentRef {
    pub node: NodeId,
    pub host: String,
    pub path: String,
}

impl AgentRef {
    pub fn new(node: NodeId, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            node,
            host: host.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for AgentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent://{}{}#{}", self.host, self.path, self.node)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentLocation {
    pub connection: Connection,
    pub reference: AgentRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HttpLocation {
    pub connection: Connection,
    pub host: String,
    pub port: u16,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TcpLocation {
    pub connection: Connection,
    pub host: String,
    pub port: u16,
}

/// A resolved endpoint, one variant per connection type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Location {
    Agent(AgentLocation),
    Http(HttpLocation),
    Tcp(TcpLocation),
}

impl Location {
    pub fn agent(connection: Connection, reference: AgentRef) -> Result<Self> {
        let location = Location::Agent(AgentLocation {
            connection,
            reference,
        });
        location.validate()?;
        Ok(location)
    }

    pub fn http(
        connection: Connection,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Result<Self> {
        let location = Location::Http(HttpLocation {
            connection,
            host: host.into(),
            port,
            path: path.into(),
        });
        location.validate()?;
        Ok(location)
    }

    pub fn tcp(connection: Connection, host: impl Into<String>, port: u16) -> Result<Self> {
        let location = Location::Tcp(TcpLocation {
            connection,
            host: host.into(),
            port,
        });
        location.validate()?;
        Ok(location)
    }

    pub fn connection(&self) -> &Connection {
        match self {
            Location::Agent(l) => &l.connection,
            Location::Http(l) => &l.connection,
            Location::Tcp(l) => &l.connection,
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Location::Agent(_) => ConnectionType::Agent,
            Location::Http(_) => ConnectionType::Http,
            Location::Tcp(_) => ConnectionType::Tcp,
        }
    }

    pub fn component_type(&self) -> ComponentType {
        self.connection().component_type()
    }

    /// Host the endpoint lives on.
    pub fn host(&self) -> &str {
        match self {
            Location::Agent(l) => &l.reference.host,
            Location::Http(l) => &l.host,
            Location::Tcp(l) => &l.host,
        }
    }

    /// The live reference carried by agent locations.
    pub fn agent_ref(&self) -> Option<&AgentRef> {
        match self {
            Location::Agent(l) => Some(&l.reference),
            _ => None,
        }
    }

    pub fn uri(&self) -> Result<Url> {
        let raw = match self {
            Location::Agent(l) => format!(
                "agent://{}/{}?node={}",
                l.reference.host,
                l.reference.path.trim_start_matches('/'),
                l.reference.node
            ),
            Location::Http(l) => {
                let path = l.path.trim_start_matches('/');
                format!("http://{}:{}/{}", l.host, l.port, path)
            }
            Location::Tcp(l) => format!("tcp://{}:{}", l.host, l.port),
        };
        Url::parse(&raw).map_err(|e| LocationError::Validation {
            field: "uri".to_string(),
            message: format!("{}: {}", raw, e),
        })
    }

    /// Check that the embedded connection matches the variant.
    pub fn validate(&self) -> Result<()> {
        let connection = self.connection();
        connection.component_id.validate()?;
        if connection.connection_type != self.connection_type() {
            return Err(LocationError::invalid_connection(format!(
                "{} location cannot carry {} connection {}",
                self.connection_type(),
                connection.connection_type,
                connection
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.uri() {
            Ok(uri) => write!(f, "{} -> {}", self.connection(), uri),
            Err(_) => write!(f, "{} -> {}", self.connection(), self.host()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ComponentId;

    fn service(name: &str) -> ComponentId {
        ComponentId::new(name, ComponentType::Service).unwrap()
    }

    #[test]
    fn test_http_location_uri() {
        let location = Location::http(
            Connection::http(service("exampleHTTPService")),
            "10.0.0.5",
            8080,
            "/path/to/resource",
        )
        .unwrap();

        assert_eq!(
            location.uri().unwrap().as_str(),
            "http://10.0.0.5:8080/path/to/resource"
        );
        assert_eq!(location.host(), "10.0.0.5");
    }

    #[test]
    fn test_tcp_location_uri() {
        let location = Location::tcp(Connection::tcp(service("exampleTcpService")), "10.0.0.5", 1234).unwrap();
        assert_eq!(location.uri().unwrap().scheme(), "tcp");
        assert_eq!(location.uri().unwrap().port(), Some(1234));
    }

    #[test]
    fn test_agent_location_uses_reference_host() {
        let reference = AgentRef::new(NodeId::new("node-a"), "10.0.0.7", "/user/hcd1");
        let hcd = ComponentId::new("hcd1", ComponentType::Hcd).unwrap();
        let location = Location::agent(Connection::agent(hcd), reference.clone()).unwrap();

        assert_eq!(location.host(), "10.0.0.7");
        assert_eq!(location.agent_ref(), Some(&reference));
        assert!(location.uri().unwrap().as_str().starts_with("agent://10.0.0.7/user/hcd1"));
    }

    #[test]
    fn test_mismatched_connection_type_rejected() {
        let result = Location::tcp(Connection::http(service("svc")), "localhost", 80);
        assert!(matches!(result, Err(LocationError::InvalidConnection { .. })));
    }

    #[test]
    fn test_validate_catches_blank_name_built_by_hand() {
        let location = Location::Tcp(TcpLocation {
            connection: Connection::tcp(ComponentId {
                name: String::new(),
                component_type: ComponentType::Service,
            }),
            host: "localhost".into(),
            port: 80,
        });
        assert!(location.validate().is_err());
    }
}
