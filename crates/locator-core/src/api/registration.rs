//! Registration methods for LocationService.

use tracing::{debug, info};

use crate::error::{LocationError, Result};
use crate::models::{Connection, Location, RegistrationResult};
use crate::LocationService;

impl LocationService {
    /// Register a location for its connection.
    ///
    /// Re-registering an identical location is a no-op. A different location
    /// for a connection already live anywhere in the cluster is rejected with
    /// [`LocationError::AlreadyRegistered`].
    pub async fn register(&self, location: Location) -> Result<RegistrationResult> {
        let state = &self.state;
        state.ensure_running()?;
        location.validate()?;

        let connection = location.connection().clone();
        if let Some(slot) = state.replica.slot(&connection) {
            if &slot.origin != state.node() {
                if let Some(existing) = slot.location {
                    if existing == location {
                        debug!("{} already registered by {}", connection, slot.origin);
                        return Ok(RegistrationResult::for_location(&location));
                    }
                    return Err(LocationError::AlreadyRegistered {
                        connection: connection.key(),
                        existing: Box::new(existing),
                    });
                }
            }
        }

        let observed = state.replica.version_of(&connection);
        let registration = state.registry.register(location, observed)?;
        if let Some(mutation) = registration.mutation {
            info!("Registered {} v{}", connection, mutation.version);
            state.publish_owned(mutation);
        }
        Ok(registration.result)
    }

    /// Remove a connection cluster-wide.
    ///
    /// Returns whether an entry existed, here or on another node.
    pub async fn unregister(&self, connection: &Connection) -> Result<bool> {
        let state = &self.state;
        state.ensure_running()?;

        let observed_live = state
            .replica
            .slot(connection)
            .filter(|slot| slot.location.is_some())
            .map(|slot| slot.version);
        let (removed, tombstone) = state.registry.unregister(connection, observed_live);
        info!("Unregistered {} v{}", connection, tombstone.version);
        state.publish_owned(tombstone);

        Ok(removed || observed_live.is_some())
    }

    /// Remove every location registered by this node.
    ///
    /// Returns the number of entries removed.
    pub async fn unregister_all(&self) -> Result<usize> {
        self.state.ensure_running()?;
        let count = self.state.withdraw_all();
        info!("Unregistered all {} local entries", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::models::{AgentRef, ComponentId, ComponentType, Connection, Location};
    use crate::transport::MemoryCluster;
    use crate::{LocationError, LocationService};

    fn http(name: &str, port: u16) -> Location {
        let id = ComponentId::new(name, ComponentType::Service).unwrap();
        Location::http(Connection::http(id), "10.0.0.1", port, "/api").unwrap()
    }

    #[tokio::test]
    async fn test_register_twice_is_idempotent() {
        let cluster = MemoryCluster::new();
        let service = LocationService::builder(cluster.join("localhost"))
            .build()
            .await
            .unwrap();

        let location = http("svc", 8080);
        let first = service.register(location.clone()).await.unwrap();
        let second = service.register(location.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.list().await, vec![location]);
    }

    #[tokio::test]
    async fn test_register_conflict_keeps_existing() {
        let cluster = MemoryCluster::new();
        let service = LocationService::builder(cluster.join("localhost"))
            .build()
            .await
            .unwrap();

        service.register(http("svc", 8080)).await.unwrap();
        match service.register(http("svc", 9090)).await {
            Err(LocationError::AlreadyRegistered { existing, .. }) => {
                assert_eq!(*existing, http("svc", 8080));
            }
            other => panic!("Expected AlreadyRegistered, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_rejects_mismatched_location() {
        let cluster = MemoryCluster::new();
        let transport = cluster.join("localhost");
        let service = LocationService::builder(transport.clone())
            .build()
            .await
            .unwrap();

        // Agent payload under an http connection.
        let id = ComponentId::new("svc", ComponentType::Service).unwrap();
        let reference = AgentRef::new(service.node_id(), "localhost", "/user/svc");
        let bad = Location::Agent(crate::models::AgentLocation {
            connection: Connection::http(id),
            reference,
        });

        assert!(service.register(bad).await.is_err());
        assert!(service.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_reports_existence() {
        let cluster = MemoryCluster::new();
        let service = LocationService::builder(cluster.join("localhost"))
            .build()
            .await
            .unwrap();

        let location = http("svc", 8080);
        service.register(location.clone()).await.unwrap();
        assert!(service.unregister(location.connection()).await.unwrap());
        assert!(!service.unregister(location.connection()).await.unwrap());
        assert!(service.list().await.is_empty());

        // Registering again after removal is allowed.
        service.register(http("svc", 9090)).await.unwrap();
        assert_eq!(service.list().await, vec![http("svc", 9090)]);
    }
}
