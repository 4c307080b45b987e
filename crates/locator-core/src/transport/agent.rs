//! Live agent references and their termination signal.

use futures::future::{self, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::sync::watch;
use tracing::debug;

use crate::models::{AgentRef, NodeId};

/// One-shot future that completes when an agent terminates.
///
/// A termination for an unknown or already dead reference completes
/// immediately.
pub struct Termination {
    inner: BoxFuture<'static, ()>,
}

impl Termination {
    pub fn new(fut: impl Future<Output = ()> + Send + 'static) -> Self {
        Self { inner: fut.boxed() }
    }

    pub fn immediate() -> Self {
        Self::new(future::ready(()))
    }

    fn from_watch(mut rx: watch::Receiver<bool>) -> Self {
        Self::new(async move {
            // A dropped sender means the directory forgot the agent.
            let _ = rx.wait_for(|terminated| *terminated).await;
        })
    }
}

impl Future for Termination {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.inner.poll_unpin(cx)
    }
}

/// Directory of agents that are currently alive.
#[derive(Default)]
pub struct AgentDirectory {
    agents: RwLock<HashMap<AgentRef, watch::Sender<bool>>>,
    next_id: AtomicU64,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a live agent hosted on `node`.
    pub fn spawn(self: &Arc<Self>, node: NodeId, host: &str, name: &str) -> AgentHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reference = AgentRef::new(node, host, format!("/user/{}-{}", name, id));
        let (tx, _) = watch::channel(false);

        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.clone(), tx);
        debug!("Spawned agent {}", reference);

        AgentHandle {
            reference,
            directory: Arc::clone(self),
        }
    }

    pub fn is_alive(&self, reference: &AgentRef) -> bool {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(reference)
    }

    /// Whether a live agent with this path exists on `node`.
    pub fn is_alive_at(&self, node: &NodeId, path: &str) -> bool {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|r| &r.node == node && r.path == path)
    }

    pub fn subscribe(&self, reference: &AgentRef) -> Termination {
        match self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
        {
            Some(tx) => Termination::from_watch(tx.subscribe()),
            None => Termination::immediate(),
        }
    }

    pub fn terminate(&self, reference: &AgentRef) -> bool {
        let removed = self
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reference);
        match removed {
            Some(tx) => {
                let _ = tx.send(true);
                debug!("Agent {} terminated", reference);
                true
            }
            None => false,
        }
    }

    /// Terminate every agent hosted on `node`.
    pub fn terminate_node(&self, node: &NodeId) -> usize {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<AgentRef> = agents.keys().filter(|r| &r.node == node).cloned().collect();
        for reference in &doomed {
            if let Some(tx) = agents.remove(reference) {
                let _ = tx.send(true);
            }
        }
        if !doomed.is_empty() {
            debug!("Terminated {} agents hosted on {}", doomed.len(), node);
        }
        doomed.len()
    }
}

/// Owner of a live agent. Stopping or dropping it terminates the reference.
pub struct AgentHandle {
    reference: AgentRef,
    directory: Arc<AgentDirectory>,
}

impl AgentHandle {
    pub fn reference(&self) -> &AgentRef {
        &self.reference
    }

    pub fn stop(self) {}
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.directory.terminate(&self.reference);
    }
}
