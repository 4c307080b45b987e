//! TCP transport between registry processes.
//!
//! Every node runs an [`server::RpcServer`] and keeps one [`client::PeerClient`]
//! per known peer. A heartbeat loop greets each peer every interval: the
//! first successful `peer.hello` reports the peer as `Joined`, and a run of
//! failed greetings reports it as `Departed`. A reply carrying a new
//! incarnation for a known node id is a restart and reports `Departed` then
//! `Joined`. Peers are learned from the configured seeds and from the
//! greetings other nodes send us.

pub mod client;
pub mod protocol;
pub mod server;

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::client::PeerClient;
use self::protocol::{
    AgentAliveParams, HelloParams, HelloReply, METHOD_AGENT_ALIVE, METHOD_APPLY, METHOD_HELLO,
    METHOD_PING, METHOD_SNAPSHOT,
};
use self::server::{RpcDispatch, RpcServer, RpcServerHandle};
use super::{
    AgentDirectory, AgentHandle, MembershipEvent, MembershipFeed, ReplicaEndpoint, Termination,
    Transport,
};
use crate::config::MembershipConfig;
use crate::error::{LocationError, Result};
use crate::models::{AgentRef, NodeId};
use crate::replication::{ReplicaMutation, WireMutation};

/// Runtime options for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub node_id: NodeId,
    /// Address to listen on. Port 0 picks a free port.
    pub bind: SocketAddr,
    /// Host advertised to peers and in agent references. Defaults to the bind IP.
    pub advertise_host: Option<String>,
    pub seeds: Vec<SocketAddr>,
    pub heartbeat_interval: Duration,
    pub departure_threshold: u32,
}

impl TcpTransportConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            node_id: NodeId::generate(),
            bind,
            advertise_host: None,
            seeds: Vec::new(),
            heartbeat_interval: MembershipConfig::HEARTBEAT_INTERVAL,
            departure_threshold: MembershipConfig::DEPARTURE_THRESHOLD,
        }
    }

    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    pub fn seed(mut self, addr: SocketAddr) -> Self {
        self.seeds.push(addr);
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn departure_threshold(mut self, missed: u32) -> Self {
        self.departure_threshold = missed.max(1);
        self
    }
}

#[derive(Default)]
struct PeerState {
    node: Option<NodeId>,
    incarnation: Option<String>,
    client: Option<Arc<PeerClient>>,
    failures: u32,
    joined: bool,
}

/// What this node knows about the node hosting an agent.
enum HostStatus {
    Reachable(Arc<PeerClient>),
    /// Not joined yet, or joined without an open connection.
    Pending,
    Departed,
}

struct TcpShared {
    node: NodeId,
    incarnation: String,
    host: String,
    listen: SocketAddr,
    departure_threshold: u32,
    heartbeat_interval: Duration,
    endpoint: RwLock<Option<Weak<dyn ReplicaEndpoint>>>,
    peers: RwLock<HashMap<SocketAddr, PeerState>>,
    feed: MembershipFeed,
    agents: Arc<AgentDirectory>,
}

impl TcpShared {
    fn peers(&self) -> RwLockReadGuard<'_, HashMap<SocketAddr, PeerState>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn peers_mut(&self) -> RwLockWriteGuard<'_, HashMap<SocketAddr, PeerState>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoint(&self) -> Option<Arc<dyn ReplicaEndpoint>> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn learn(&self, addr: SocketAddr) {
        if addr == self.listen {
            return;
        }
        let mut peers = self.peers_mut();
        if !peers.contains_key(&addr) {
            debug!("Learned peer {}", addr);
            peers.insert(addr, PeerState::default());
        }
    }

    fn client_for(&self, node: &NodeId) -> Option<Arc<PeerClient>> {
        self.peers()
            .values()
            .find(|p| p.joined && p.node.as_ref() == Some(node))
            .and_then(|p| p.client.clone())
    }

    fn host_status(&self, node: &NodeId) -> HostStatus {
        let peers = self.peers();
        let mut known = false;
        for peer in peers.values().filter(|p| p.node.as_ref() == Some(node)) {
            if peer.joined {
                return match &peer.client {
                    Some(client) => HostStatus::Reachable(Arc::clone(client)),
                    None => HostStatus::Pending,
                };
            }
            known = true;
        }
        if known {
            HostStatus::Departed
        } else {
            HostStatus::Pending
        }
    }

    fn joined_clients(&self) -> (usize, Vec<Arc<PeerClient>>) {
        let peers = self.peers();
        let clients = peers
            .values()
            .filter(|p| p.joined)
            .filter_map(|p| p.client.clone())
            .collect();
        (peers.len(), clients)
    }

    async fn greet_all(&self) {
        let targets: Vec<(SocketAddr, Option<Arc<PeerClient>>)> = self
            .peers()
            .iter()
            .map(|(addr, p)| (*addr, p.client.clone()))
            .collect();

        let hello = HelloParams {
            node: self.node.clone(),
            host: self.host.clone(),
            listen: self.listen,
        };

        let outcomes = join_all(
            targets
                .into_iter()
                .map(|(addr, client)| self.greet(addr, client, hello.clone())),
        )
        .await;

        for (addr, outcome) in outcomes {
            match outcome {
                Ok((client, reply)) => self.record_hello(addr, client, reply),
                Err(e) => self.record_silence(addr, e),
            }
        }
    }

    async fn greet(
        &self,
        addr: SocketAddr,
        client: Option<Arc<PeerClient>>,
        hello: HelloParams,
    ) -> (SocketAddr, Result<(Arc<PeerClient>, HelloReply)>) {
        let outcome = async {
            let client = match client {
                Some(client) => client,
                None => Arc::new(PeerClient::connect(addr).await?),
            };
            let value = client.call(METHOD_HELLO, serde_json::to_value(&hello)?).await?;
            let reply: HelloReply = serde_json::from_value(value)?;
            Ok::<_, LocationError>((client, reply))
        }
        .await;
        (addr, outcome)
    }

    fn record_hello(&self, addr: SocketAddr, client: Arc<PeerClient>, reply: HelloReply) {
        let mut peers = self.peers_mut();
        if reply.node == self.node {
            debug!("Dropping {} from peers: it is this node", addr);
            peers.remove(&addr);
            return;
        }

        // The node may already be joined through another address. The same
        // incarnation there keeps its membership; an older one has restarted.
        let mut held_elsewhere = false;
        for (other, peer) in peers.iter_mut() {
            if *other == addr || !peer.joined || peer.node.as_ref() != Some(&reply.node) {
                continue;
            }
            if peer.incarnation.as_deref() == Some(reply.incarnation.as_str()) {
                held_elsewhere = true;
            } else {
                info!("Peer {} restarted at {} (was at {})", reply.node, addr, other);
                peer.joined = false;
                peer.client = None;
                self.feed.publish(MembershipEvent::Departed(reply.node.clone()));
            }
        }

        let Some(peer) = peers.get_mut(&addr) else {
            return;
        };
        peer.failures = 0;
        peer.client = Some(client);

        let same_process = peer.node.as_ref() == Some(&reply.node)
            && peer.incarnation.as_deref() == Some(reply.incarnation.as_str());
        if peer.joined && !same_process {
            if let Some(previous) = peer.node.take() {
                info!("Peer {} restarted as {} (was {})", addr, reply.node, previous);
                self.feed.publish(MembershipEvent::Departed(previous));
            }
            peer.joined = false;
        }
        peer.node = Some(reply.node.clone());
        peer.incarnation = Some(reply.incarnation);

        if !peer.joined && !held_elsewhere {
            info!("Peer {} at {} joined", reply.node, addr);
            peer.joined = true;
            self.feed.publish(MembershipEvent::Joined(reply.node));
        }
    }

    fn record_silence(&self, addr: SocketAddr, error: LocationError) {
        let mut peers = self.peers_mut();
        let Some(peer) = peers.get_mut(&addr) else {
            return;
        };
        peer.client = None;
        peer.failures += 1;
        debug!("Greeting {} failed ({}): {}", addr, peer.failures, error);
        if peer.joined && peer.failures >= self.departure_threshold {
            peer.joined = false;
            if let Some(node) = peer.node.clone() {
                warn!(
                    "Peer {} at {} departed after {} missed heartbeats",
                    node, addr, peer.failures
                );
                self.feed.publish(MembershipEvent::Departed(node));
            }
        }
    }

    fn members(peers: &HashMap<SocketAddr, PeerState>) -> Vec<NodeId> {
        peers
            .values()
            .filter(|p| p.joined)
            .filter_map(|p| p.node.clone())
            .collect()
    }
}

/// Method table for calls arriving from peers.
struct PeerDispatch {
    shared: Arc<TcpShared>,
}

#[async_trait]
impl RpcDispatch for PeerDispatch {
    async fn dispatch(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, LocationError> {
        match method {
            METHOD_PING => Ok(serde_json::json!("pong")),
            METHOD_HELLO => {
                let hello: HelloParams =
                    serde_json::from_value(params).map_err(|e| LocationError::InvalidParams {
                        message: format!("bad hello: {}", e),
                    })?;
                if hello.node != self.shared.node {
                    self.shared.learn(hello.listen);
                }
                Ok(serde_json::to_value(HelloReply {
                    node: self.shared.node.clone(),
                    host: self.shared.host.clone(),
                    incarnation: self.shared.incarnation.clone(),
                })?)
            }
            METHOD_APPLY => {
                let mutation = ReplicaMutation::from_json(params)?;
                match self.shared.endpoint() {
                    Some(endpoint) => {
                        endpoint.apply(mutation);
                        Ok(serde_json::json!({ "applied": true }))
                    }
                    None => Ok(serde_json::json!({ "applied": false })),
                }
            }
            METHOD_SNAPSHOT => {
                let wire: Vec<WireMutation> = self
                    .shared
                    .endpoint()
                    .map(|endpoint| endpoint.snapshot())
                    .unwrap_or_default()
                    .iter()
                    .map(ReplicaMutation::to_wire)
                    .collect();
                Ok(serde_json::to_value(wire)?)
            }
            METHOD_AGENT_ALIVE => {
                let query: AgentAliveParams =
                    serde_json::from_value(params).map_err(|e| LocationError::InvalidParams {
                        message: format!("bad agent query: {}", e),
                    })?;
                Ok(serde_json::json!(self
                    .shared
                    .agents
                    .is_alive_at(&self.shared.node, &query.path)))
            }
            _ => Err(LocationError::InvalidParams {
                message: format!("Unknown method: {}", method),
            }),
        }
    }
}

/// Transport over length-prefixed JSON-RPC 2.0 on TCP.
pub struct TcpTransport {
    shared: Arc<TcpShared>,
    server: Mutex<Option<RpcServerHandle>>,
    heartbeat_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Bind the peer server and start greeting seeds.
    pub async fn start(config: TcpTransportConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.bind).await?;
        let listen = listener.local_addr()?;
        let host = config
            .advertise_host
            .clone()
            .unwrap_or_else(|| listen.ip().to_string());

        let shared = Arc::new(TcpShared {
            node: config.node_id.clone(),
            incarnation: uuid::Uuid::new_v4().to_string(),
            host,
            listen,
            departure_threshold: config.departure_threshold.max(1),
            heartbeat_interval: config.heartbeat_interval,
            endpoint: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            feed: MembershipFeed::default(),
            agents: Arc::new(AgentDirectory::new()),
        });
        for seed in &config.seeds {
            shared.learn(*seed);
        }

        let server = RpcServer::serve(
            listener,
            Arc::new(PeerDispatch {
                shared: Arc::clone(&shared),
            }),
        )?;
        let heartbeat_task = tokio::spawn(Self::heartbeat_loop(Arc::downgrade(&shared)));

        info!(
            "TCP transport for {} listening on {} ({} seeds)",
            shared.node,
            listen,
            config.seeds.len()
        );

        Ok(Arc::new(Self {
            shared,
            server: Mutex::new(Some(server)),
            heartbeat_task,
        }))
    }

    async fn heartbeat_loop(shared: Weak<TcpShared>) {
        let interval = match shared.upgrade() {
            Some(shared) => shared.heartbeat_interval,
            None => return,
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else {
                break;
            };
            shared.greet_all().await;
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.listen
    }

    /// Round-trip time of a `ping` to `addr` over a fresh connection.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Duration> {
        let started = Instant::now();
        let client = PeerClient::connect(addr).await?;
        match client.call(METHOD_PING, serde_json::json!({})).await? {
            serde_json::Value::String(reply) if reply == "pong" => Ok(started.elapsed()),
            other => Err(LocationError::Other(format!(
                "unexpected ping reply from {}: {}",
                addr, other
            ))),
        }
    }

    /// Add a peer address at runtime.
    pub fn add_peer(&self, addr: SocketAddr) {
        self.shared.learn(addr);
    }

    /// Node ids of peers currently considered members.
    pub fn members(&self) -> Vec<NodeId> {
        TcpShared::members(&self.shared.peers())
    }

    pub fn agents(&self) -> &Arc<AgentDirectory> {
        &self.shared.agents
    }

    /// Stop serving and greeting. Peers will see this node depart.
    pub fn shutdown(&self) {
        self.heartbeat_task.abort();
        if let Some(mut server) = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            server.shutdown();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_node(&self) -> NodeId {
        self.shared.node.clone()
    }

    fn local_host(&self) -> String {
        self.shared.host.clone()
    }

    fn bind(&self, endpoint: Arc<dyn ReplicaEndpoint>) {
        *self
            .shared
            .endpoint
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(&endpoint));
    }

    async fn broadcast(&self, mutation: &ReplicaMutation) -> Result<()> {
        let (known, clients) = self.shared.joined_clients();
        if known == 0 {
            return Ok(());
        }
        if clients.is_empty() {
            return Err(LocationError::MembershipUnavailable {
                message: format!("none of {} known peers is reachable", known),
            });
        }

        let params = mutation.to_json()?;
        let results = join_all(
            clients
                .iter()
                .map(|client| client.call(METHOD_APPLY, params.clone())),
        )
        .await;

        let failed: Vec<String> = results
            .into_iter()
            .zip(&clients)
            .filter_map(|(result, client)| result.err().map(|e| format!("{}: {}", client.addr(), e)))
            .collect();

        if failed.is_empty() {
            Ok(())
        } else if failed.len() == clients.len() {
            Err(LocationError::MembershipUnavailable {
                message: failed.join("; "),
            })
        } else {
            Err(LocationError::Other(format!(
                "{} of {} peers missed {}: {}",
                failed.len(),
                clients.len(),
                mutation.connection,
                failed.join("; ")
            )))
        }
    }

    fn membership_events(&self) -> BoxStream<'static, MembershipEvent> {
        let peers = self.shared.peers();
        self.shared.feed.subscribe(TcpShared::members(&peers))
    }

    async fn request_snapshot(&self, node: &NodeId) -> Result<Vec<ReplicaMutation>> {
        let client =
            self.shared
                .client_for(node)
                .ok_or_else(|| LocationError::MembershipUnavailable {
                    message: format!("no connection to {}", node),
                })?;

        let value = client.call(METHOD_SNAPSHOT, serde_json::json!({})).await?;
        let wire: Vec<WireMutation> = serde_json::from_value(value)?;

        let mut mutations = Vec::with_capacity(wire.len());
        for entry in wire {
            match entry.decode() {
                Ok(mutation) => mutations.push(mutation),
                Err(e) => warn!("Skipping snapshot entry from {}: {}", node, e),
            }
        }
        Ok(mutations)
    }

    fn subscribe_termination(&self, reference: &AgentRef) -> Termination {
        if reference.node == self.shared.node {
            return self.shared.agents.subscribe(reference);
        }

        // Remote agents: poll the hosting node until it reports the agent
        // gone or departs. A host not joined yet is waited for.
        let shared = Arc::downgrade(&self.shared);
        let reference = reference.clone();
        Termination::new(async move {
            loop {
                let Some(current) = shared.upgrade() else {
                    return;
                };
                let status = current.host_status(&reference.node);
                let interval = current.heartbeat_interval;
                drop(current);

                match status {
                    HostStatus::Departed => {
                        debug!("Host of {} departed, treating as terminated", reference);
                        return;
                    }
                    HostStatus::Pending => {}
                    HostStatus::Reachable(client) => {
                        let query = serde_json::json!({ "path": reference.path });
                        if let Ok(serde_json::Value::Bool(false)) =
                            client.call(METHOD_AGENT_ALIVE, query).await
                        {
                            return;
                        }
                    }
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    fn spawn_agent(&self, name: &str) -> AgentHandle {
        self.shared
            .agents
            .spawn(self.shared.node.clone(), &self.shared.host, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn fast_config() -> TcpTransportConfig {
        TcpTransportConfig::new("127.0.0.1:0".parse().unwrap())
            .heartbeat_interval(Duration::from_millis(20))
            .departure_threshold(2)
    }

    async fn next_event(events: &mut BoxStream<'static, MembershipEvent>) -> MembershipEvent {
        tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("no membership event")
            .expect("membership stream ended")
    }

    #[tokio::test]
    async fn test_seeded_peers_join_both_ways() {
        let a = TcpTransport::start(fast_config().node_id(NodeId::new("a")))
            .await
            .unwrap();
        let mut a_events = a.membership_events();
        let b = TcpTransport::start(
            fast_config()
                .node_id(NodeId::new("b"))
                .seed(a.local_addr()),
        )
        .await
        .unwrap();
        let mut b_events = b.membership_events();

        assert_eq!(
            next_event(&mut b_events).await,
            MembershipEvent::Joined(NodeId::new("a"))
        );
        // a learns b from its greeting.
        assert_eq!(
            next_event(&mut a_events).await,
            MembershipEvent::Joined(NodeId::new("b"))
        );
    }

    #[tokio::test]
    async fn test_stopped_peer_departs() {
        let a = TcpTransport::start(fast_config().node_id(NodeId::new("a")))
            .await
            .unwrap();
        let b = TcpTransport::start(
            fast_config()
                .node_id(NodeId::new("b"))
                .seed(a.local_addr()),
        )
        .await
        .unwrap();
        let mut b_events = b.membership_events();
        assert_eq!(
            next_event(&mut b_events).await,
            MembershipEvent::Joined(NodeId::new("a"))
        );

        a.shutdown();
        drop(a);

        assert_eq!(
            next_event(&mut b_events).await,
            MembershipEvent::Departed(NodeId::new("a"))
        );
    }

    #[tokio::test]
    async fn test_seeding_self_is_ignored() {
        let a = TcpTransport::start(fast_config().node_id(NodeId::new("a")))
            .await
            .unwrap();
        a.add_peer(a.local_addr());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.members().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_without_peers_succeeds() {
        let a = TcpTransport::start(fast_config()).await.unwrap();
        let agent = a.spawn_agent("hcd1");
        assert_eq!(agent.reference().host, "127.0.0.1");

        let id = crate::models::ComponentId::new("svc", crate::models::ComponentType::Service)
            .unwrap();
        let location =
            crate::models::Location::tcp(crate::models::Connection::tcp(id), "127.0.0.1", 9)
                .unwrap();
        let mutation = ReplicaMutation::live(location, a.local_node(), 1);
        assert!(a.broadcast(&mutation).await.is_ok());
    }

    #[tokio::test]
    async fn test_restart_with_same_node_id_departs_and_rejoins() {
        // Silence alone never departs a peer here; only the new incarnation can.
        let a = TcpTransport::start(
            fast_config()
                .node_id(NodeId::new("a"))
                .departure_threshold(1000),
        )
        .await
        .unwrap();
        let mut a_events = a.membership_events();

        let b = TcpTransport::start(
            fast_config()
                .node_id(NodeId::new("b"))
                .seed(a.local_addr()),
        )
        .await
        .unwrap();
        assert_eq!(
            next_event(&mut a_events).await,
            MembershipEvent::Joined(NodeId::new("b"))
        );
        b.shutdown();
        drop(b);

        let _b_again = TcpTransport::start(
            fast_config()
                .node_id(NodeId::new("b"))
                .seed(a.local_addr()),
        )
        .await
        .unwrap();
        assert_eq!(
            next_event(&mut a_events).await,
            MembershipEvent::Departed(NodeId::new("b"))
        );
        assert_eq!(
            next_event(&mut a_events).await,
            MembershipEvent::Joined(NodeId::new("b"))
        );
        assert_eq!(a.members(), vec![NodeId::new("b")]);
    }

    #[tokio::test]
    async fn test_termination_waits_for_host_that_has_not_joined() {
        let a = TcpTransport::start(fast_config().node_id(NodeId::new("a")))
            .await
            .unwrap();
        let b = TcpTransport::start(fast_config().node_id(NodeId::new("b")))
            .await
            .unwrap();
        let agent = b.spawn_agent("worker");

        let mut termination = a.subscribe_termination(agent.reference());
        assert!(tokio::time::timeout(Duration::from_millis(150), &mut termination)
            .await
            .is_err());

        let mut a_events = a.membership_events();
        a.add_peer(b.local_addr());
        assert_eq!(
            next_event(&mut a_events).await,
            MembershipEvent::Joined(NodeId::new("b"))
        );
        assert!(tokio::time::timeout(Duration::from_millis(100), &mut termination)
            .await
            .is_err());

        agent.stop();
        tokio::time::timeout(Duration::from_secs(5), termination)
            .await
            .expect("agent stop should be observed");
    }

    #[tokio::test]
    async fn test_ping_reports_round_trip() {
        let a = TcpTransport::start(fast_config()).await.unwrap();
        let b = TcpTransport::start(fast_config()).await.unwrap();

        assert!(a.ping(b.local_addr()).await.is_ok());

        let closed = b.local_addr();
        b.shutdown();
        drop(b);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.ping(closed).await.is_err());
    }
}
