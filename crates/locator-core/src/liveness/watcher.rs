//! Termination watches on agent references.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::models::{AgentRef, Connection, NodeId};
use crate::transport::Transport;

/// Who is allowed to act on a termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchScope {
    /// Entry authored by this node; a termination is reaped and broadcast.
    Owned,
    /// Replica entry authored by `origin`; a termination only drops the local copy.
    Replica { origin: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Watching,
    Terminated,
}

/// Emitted once per watch when its reference terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationEvent {
    pub connection: Connection,
    pub scope: WatchScope,
    /// Version of the entry the watch was armed for.
    pub version: u64,
}

struct Watch {
    reference: AgentRef,
    scope: WatchScope,
    version: u64,
    state: WatchState,
    task: JoinHandle<()>,
}

/// Watches the agents behind registered locations.
///
/// At most one watch exists per connection; arming a new one replaces the
/// previous watch. Termination events are delivered on the channel returned
/// by [`LivenessWatcher::new`] and must be acknowledged with
/// [`LivenessWatcher::fire`].
pub struct LivenessWatcher {
    transport: Arc<dyn Transport>,
    watches: Mutex<HashMap<Connection, Watch>>,
    events: mpsc::UnboundedSender<TerminationEvent>,
}

impl LivenessWatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<TerminationEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                watches: Mutex::new(HashMap::new()),
                events,
            },
            rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Connection, Watch>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn watch(
        &self,
        connection: Connection,
        reference: AgentRef,
        scope: WatchScope,
        version: u64,
    ) {
        let termination = self.transport.subscribe_termination(&reference);
        let event = TerminationEvent {
            connection: connection.clone(),
            scope: scope.clone(),
            version,
        };
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            termination.await;
            let _ = events.send(event);
        });

        debug!("Watching {} for {} ({:?})", reference, connection, scope);
        let previous = self.lock().insert(
            connection,
            Watch {
                reference,
                scope,
                version,
                state: WatchState::Watching,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    /// Cancel the watch on a connection.
    pub fn unwatch(&self, connection: &Connection) -> bool {
        match self.lock().remove(connection) {
            Some(watch) => {
                watch.task.abort();
                debug!("Stopped watching {}", connection);
                true
            }
            None => false,
        }
    }

    /// Cancel every replica watch on entries authored by `origin`.
    pub fn unwatch_origin(&self, origin: &NodeId) -> usize {
        let mut watches = self.lock();
        let before = watches.len();
        watches.retain(|_, watch| {
            let doomed = matches!(&watch.scope, WatchScope::Replica { origin: o } if o == origin);
            if doomed {
                watch.task.abort();
            }
            !doomed
        });
        before - watches.len()
    }

    /// Move a watch from `Watching` to `Terminated`.
    ///
    /// Returns false for events that no longer match the current watch, for
    /// instance when the entry was re-registered after the event was queued.
    /// The terminated watch stays until [`LivenessWatcher::unwatch`].
    pub fn fire(&self, event: &TerminationEvent) -> bool {
        match self.lock().get_mut(&event.connection) {
            Some(watch)
                if watch.version == event.version
                    && watch.scope == event.scope
                    && watch.state == WatchState::Watching =>
            {
                watch.state = WatchState::Terminated;
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, connection: &Connection) -> Option<WatchState> {
        self.lock().get(connection).map(|watch| watch.state)
    }

    pub fn reference(&self, connection: &Connection) -> Option<AgentRef> {
        self.lock()
            .get(connection)
            .map(|watch| watch.reference.clone())
    }

    /// Connections with a live watch.
    pub fn watched(&self) -> Vec<Connection> {
        self.lock()
            .iter()
            .filter(|(_, watch)| watch.state == WatchState::Watching)
            .map(|(connection, _)| connection.clone())
            .collect()
    }

    /// Abort every watch.
    pub fn clear(&self) {
        for (_, watch) in self.lock().drain() {
            watch.task.abort();
        }
    }
}

impl Drop for LivenessWatcher {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComponentId, ComponentType};
    use crate::transport::MemoryCluster;
    use std::time::Duration;

    fn hcd(name: &str) -> Connection {
        Connection::agent(ComponentId::new(name, ComponentType::Hcd).unwrap())
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TerminationEvent>) -> TerminationEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no termination event")
            .expect("watcher dropped")
    }

    #[tokio::test]
    async fn test_termination_emits_event_once() {
        let cluster = MemoryCluster::new();
        let transport = cluster.join("localhost");
        let (watcher, mut rx) = LivenessWatcher::new(transport.clone());
        let agent = transport.spawn_agent("hcd1");

        watcher.watch(hcd("hcd1"), agent.reference().clone(), WatchScope::Owned, 1);
        assert_eq!(watcher.state(&hcd("hcd1")), Some(WatchState::Watching));

        agent.stop();
        let event = next_event(&mut rx).await;
        assert_eq!(event.connection, hcd("hcd1"));
        assert_eq!(event.version, 1);

        assert!(watcher.fire(&event));
        assert!(!watcher.fire(&event));
        assert_eq!(watcher.state(&hcd("hcd1")), Some(WatchState::Terminated));
        assert!(watcher.watched().is_empty());

        assert!(watcher.unwatch(&hcd("hcd1")));
        assert_eq!(watcher.state(&hcd("hcd1")), None);
    }

    #[tokio::test]
    async fn test_rewatch_invalidates_stale_event() {
        let cluster = MemoryCluster::new();
        let transport = cluster.join("localhost");
        let (watcher, _rx) = LivenessWatcher::new(transport.clone());
        let agent = transport.spawn_agent("hcd1");

        watcher.watch(hcd("hcd1"), agent.reference().clone(), WatchScope::Owned, 1);
        watcher.watch(hcd("hcd1"), agent.reference().clone(), WatchScope::Owned, 3);

        let stale = TerminationEvent {
            connection: hcd("hcd1"),
            scope: WatchScope::Owned,
            version: 1,
        };
        assert!(!watcher.fire(&stale));
        assert_eq!(watcher.watched(), vec![hcd("hcd1")]);
    }

    #[tokio::test]
    async fn test_unwatch_cancels_delivery() {
        let cluster = MemoryCluster::new();
        let transport = cluster.join("localhost");
        let (watcher, mut rx) = LivenessWatcher::new(transport.clone());
        let agent = transport.spawn_agent("hcd1");

        watcher.watch(hcd("hcd1"), agent.reference().clone(), WatchScope::Owned, 1);
        assert!(watcher.unwatch(&hcd("hcd1")));
        agent.stop();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unwatch_origin_only_drops_that_origins_replicas() {
        let cluster = MemoryCluster::new();
        let transport = cluster.join("localhost");
        let (watcher, _rx) = LivenessWatcher::new(transport.clone());
        let agent = transport.spawn_agent("shared");
        let b = NodeId::new("b");

        watcher.watch(hcd("mine"), agent.reference().clone(), WatchScope::Owned, 1);
        watcher.watch(
            hcd("theirs"),
            agent.reference().clone(),
            WatchScope::Replica { origin: b.clone() },
            1,
        );

        assert_eq!(watcher.unwatch_origin(&b), 1);
        assert_eq!(watcher.watched(), vec![hcd("mine")]);
    }
}
