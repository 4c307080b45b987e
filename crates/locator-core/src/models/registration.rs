use serde::{Deserialize, Serialize};

use super::component::ComponentId;
use super::connection::Connection;
use super::location::Location;

/// Returned by a successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub component_id: ComponentId,
    pub connection: Connection,
}

impl RegistrationResult {
    pub(crate) fn for_location(location: &Location) -> Self {
        let connection = location.connection().clone();
        Self {
            component_id: connection.component_id.clone(),
            connection,
        }
    }
}

/// A change to the resolved location of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LocationUpdate {
    Updated(Location),
    Removed(Connection),
}

impl LocationUpdate {
    pub fn connection(&self) -> &Connection {
        match self {
            LocationUpdate::Updated(location) => location.connection(),
            LocationUpdate::Removed(connection) => connection,
        }
    }
}
