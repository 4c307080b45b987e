//! Change tracking for a single connection.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::models::{Connection, Location, LocationUpdate};
use crate::replication::ReplicaCache;

/// Infinite stream of [`LocationUpdate`]s for one connection.
///
/// The current location (if any) is emitted first. Dropping the tracker, or
/// calling [`LocationTracker::cancel`], releases its listener. Each call to
/// `track` yields an independent tracker, so tracking can be restarted at any
/// time.
pub struct LocationTracker {
    connection: Connection,
    inner: BoxStream<'static, LocationUpdate>,
}

impl LocationTracker {
    pub(crate) fn new(cache: Arc<ReplicaCache>, connection: Connection) -> Self {
        // Subscribe before reading so nothing merged in between is missed.
        let rx = cache.subscribe();
        let initial = cache.get(&connection).map(LocationUpdate::Updated);

        let state = TrackState {
            rx,
            cache,
            connection: connection.clone(),
            last: None,
            initial,
        };

        let inner = stream::unfold(state, |mut state| async move {
            let update = state.next_update().await?;
            Some((update, state))
        })
        .boxed();

        Self { connection, inner }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Stop tracking and release the listener.
    pub fn cancel(self) {
        debug!("Tracking of {} cancelled", self.connection);
    }
}

impl Stream for LocationTracker {
    type Item = LocationUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

struct TrackState {
    rx: broadcast::Receiver<LocationUpdate>,
    cache: Arc<ReplicaCache>,
    connection: Connection,
    last: Option<Location>,
    initial: Option<LocationUpdate>,
}

impl TrackState {
    async fn next_update(&mut self) -> Option<LocationUpdate> {
        if let Some(initial) = self.initial.take() {
            if let Some(update) = self.observe(initial) {
                return Some(update);
            }
        }

        loop {
            let update = match self.rx.recv().await {
                Ok(update) if update.connection() == &self.connection => update,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(
                        "Tracker for {} lagged by {} events, re-reading replica",
                        self.connection, skipped
                    );
                    match self.cache.get(&self.connection) {
                        Some(location) => LocationUpdate::Updated(location),
                        None => LocationUpdate::Removed(self.connection.clone()),
                    }
                }
                Err(RecvError::Closed) => return None,
            };

            if let Some(update) = self.observe(update) {
                return Some(update);
            }
        }
    }

    /// Drop updates that don't change what this tracker last reported.
    fn observe(&mut self, update: LocationUpdate) -> Option<LocationUpdate> {
        match &update {
            LocationUpdate::Updated(location) => {
                if self.last.as_ref() == Some(location) {
                    return None;
                }
                self.last = Some(location.clone());
            }
            LocationUpdate::Removed(_) => {
                self.last.take()?;
            }
        }
        Some(update)
    }
}
