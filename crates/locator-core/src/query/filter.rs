//! Stateless predicates over locations.

use serde::{Deserialize, Serialize};

use crate::models::{ComponentType, ConnectionType, Location};

/// Predicate applied by `list` queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum LocationFilter {
    All,
    ComponentType(ComponentType),
    ConnectionType(ConnectionType),
    /// Exact match against [`Location::host`].
    Hostname(String),
}

impl LocationFilter {
    pub fn matches(&self, location: &Location) -> bool {
        match self {
            LocationFilter::All => true,
            LocationFilter::ComponentType(kind) => location.component_type() == *kind,
            LocationFilter::ConnectionType(kind) => location.connection_type() == *kind,
            LocationFilter::Hostname(host) => location.host() == host,
        }
    }
}

impl Default for LocationFilter {
    fn default() -> Self {
        LocationFilter::All
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentRef, ComponentId, Connection, NodeId};

    fn hcd_agent(host: &str) -> Location {
        let id = ComponentId::new("hcd1", ComponentType::Hcd).unwrap();
        let reference = AgentRef::new(NodeId::new("node-a"), host, "/user/hcd1");
        Location::agent(Connection::agent(id), reference).unwrap()
    }

    fn service_tcp(host: &str) -> Location {
        let id = ComponentId::new("exampleTcpService", ComponentType::Service).unwrap();
        Location::tcp(Connection::tcp(id), host, 8080).unwrap()
    }

    #[test]
    fn test_component_type_filter() {
        let filter = LocationFilter::ComponentType(ComponentType::Hcd);
        assert!(filter.matches(&hcd_agent("h1")));
        assert!(!filter.matches(&service_tcp("h1")));
    }

    #[test]
    fn test_connection_type_filter() {
        let filter = LocationFilter::ConnectionType(ConnectionType::Tcp);
        assert!(filter.matches(&service_tcp("h1")));
        assert!(!filter.matches(&hcd_agent("h1")));
    }

    #[test]
    fn test_hostname_filter_is_exact() {
        let filter = LocationFilter::Hostname("10.1.1.1".into());
        assert!(filter.matches(&service_tcp("10.1.1.1")));
        assert!(filter.matches(&hcd_agent("10.1.1.1")));
        assert!(!filter.matches(&service_tcp("10.1.1.10")));
        assert!(!filter.matches(&service_tcp("10.1.1")));
    }

    #[test]
    fn test_all_matches_everything() {
        assert!(LocationFilter::default().matches(&hcd_agent("x")));
        assert!(LocationFilter::All.matches(&service_tcp("y")));
    }
}
