use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};
use rand::Rng;
use serde_bytes::ByteBuf;
use tokio::{net::UdpSocket, sync::{mpsc, oneshot}, time};
use crate::{alert::Alert, AlertTx, ID};

mod krpc;
mod node_id;
mod routing;
mod rpc;
mod traversal;

pub use node_id::NodeId;
pub use routing::{NodeEntry, RoutingTable, BUCKET_SIZE};
use krpc::{KrpcArgs, KrpcMessage, KrpcResponse};
use rpc::{RpcManager, TimeoutKind};
use traversal::{Traversal, TraversalKind};

pub type DhtTx = mpsc::UnboundedSender<DhtCommand>;
type DhtRx = mpsc::UnboundedReceiver<DhtCommand>;
pub type Result<T> = std::result::Result<T, DhtError>;

// Traversal id zero marks fire-and-forget RPCs (announces, pings).
const NO_TRAVERSAL: u32 = 0;

// Announced peers kept per infohash on the server side.
const MAX_STORED_PEERS: usize = 128;

#[derive(thiserror::Error, Debug)]
pub enum DhtError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(String),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for DhtError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        DhtError::Channel(e.to_string())
    }
}

pub enum DhtCommand {

    // A peer advertised its DHT port; try to admit it to the table.
    AddNode(SocketAddr),

    // Seed the table from routers and walk toward our own id.
    Bootstrap(Vec<SocketAddr>),

    // Iterative get_peers lookup; resolves with the peers found.
    GetPeers {
        info_hash: ID,
        tx: oneshot::Sender<Vec<SocketAddr>>,
    },

    // get_peers plus announce_peer to the closest nodes on completion.
    Announce {
        info_hash: ID,
        port: u16,
        tx: oneshot::Sender<Vec<SocketAddr>>,
    },

    // Routing table snapshot, for persistence.
    Snapshot(oneshot::Sender<Vec<NodeEntry>>),

    Shutdown,

}

#[derive(Debug, Clone)]
pub struct DhtConfig {

    pub enforce_node_id: bool,

    pub restrict_search_ips: bool,

    pub aggressive_lookups: bool,

    pub routers: Vec<SocketAddr>,

}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enforce_node_id: false,
            restrict_search_ips: true,
            aggressive_lookups: false,
            routers: Vec::new(),
        }
    }
}

// What to do when a traversal completes.
enum PendingAction {

    Bootstrap,

    Refresh,

    GetPeers {
        tx: oneshot::Sender<Vec<SocketAddr>>,
    },

    Announce {
        info_hash: ID,
        port: u16,
        tx: oneshot::Sender<Vec<SocketAddr>>,
    },

}

pub struct Dht {

    socket: UdpSocket,

    routing: RoutingTable,

    rpc: RpcManager,

    traversals: HashMap<u32, Traversal>,

    pending: HashMap<u32, PendingAction>,

    next_traversal_id: u32,

    config: DhtConfig,

    cmd_rx: DhtRx,

    alert_tx: AlertTx,

    // Write tokens we handed out, per requesting address.
    issued_tokens: HashMap<SocketAddr, Vec<u8>>,

    // Peers announced to us, per infohash.
    stored_peers: HashMap<ID, Vec<SocketAddr>>,

}

impl Dht {

    pub async fn bind(
        addr: SocketAddr,
        config: DhtConfig,
        alert_tx: AlertTx,
    ) -> Result<(Self, DhtTx)> {
        let socket = UdpSocket::bind(addr).await?;
        let own_id = NodeId::random();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                socket,
                routing: RoutingTable::new(own_id),
                rpc: RpcManager::new(),
                traversals: HashMap::new(),
                pending: HashMap::new(),
                next_traversal_id: 1,
                config,
                cmd_rx,
                alert_tx,
                issued_tokens: HashMap::new(),
                stored_peers: HashMap::new(),
            },
            cmd_tx,
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(&mut self) -> Result<()> {
        let mut ticker = time::interval(Duration::from_secs(1));
        let mut buf = [0u8; 1500];

        loop { tokio::select! {

            recv = self.socket.recv_from(&mut buf) => {
                match recv {
                    Ok((n, from)) => {
                        if let Err(e) = self.handle_datagram(&buf[..n], from).await {
                            tracing::trace!("bad datagram from {}: {}", from, e);
                        }
                    }
                    Err(e) => tracing::debug!("dht socket error: {}", e),
                }
            }

            Some(cmd) = self.cmd_rx.recv() => {
                match cmd {

                    DhtCommand::AddNode(addr) => {
                        // Ping it; a response admits it to the table.
                        self.send_query(NO_TRAVERSAL, addr, None, "ping", KrpcArgs::default()).await.ok();
                    }

                    DhtCommand::Bootstrap(routers) => {
                        self.config.routers = routers;
                        let target = self.routing.own_id();
                        self.start_traversal(
                            target,
                            TraversalKind::FindNode,
                            PendingAction::Bootstrap,
                        ).await?;
                    }

                    DhtCommand::GetPeers { info_hash, tx } => {
                        self.start_traversal(
                            NodeId(info_hash),
                            TraversalKind::GetPeers,
                            PendingAction::GetPeers { tx },
                        ).await?;
                    }

                    DhtCommand::Announce { info_hash, port, tx } => {
                        self.start_traversal(
                            NodeId(info_hash),
                            TraversalKind::GetPeers,
                            PendingAction::Announce { info_hash, port, tx },
                        ).await?;
                    }

                    DhtCommand::Snapshot(tx) => {
                        tx.send(self.routing.export()).ok();
                    }

                    DhtCommand::Shutdown => {
                        for traversal in self.traversals.values_mut() {
                            traversal.abort();
                        }
                        break;
                    }
                }
            }

            _ = ticker.tick() => self.tick().await?,

        }}

        Ok(())
    }

    fn alloc_traversal_id(&mut self) -> u32 {
        let id = self.next_traversal_id;
        self.next_traversal_id = self.next_traversal_id.wrapping_add(1).max(1);
        id
    }

    async fn start_traversal(
        &mut self,
        target: NodeId,
        kind: TraversalKind,
        action: PendingAction,
    ) -> Result<()> {
        let id = self.alloc_traversal_id();
        let mut traversal = Traversal::new(
            id,
            target,
            kind,
            self.config.aggressive_lookups,
            self.config.restrict_search_ips,
        );

        let seeds: Vec<(NodeId, SocketAddr)> = self
            .routing
            .closest(&target, BUCKET_SIZE)
            .into_iter()
            .map(|n| (n.id, n.addr))
            .collect();
        traversal.seed(&seeds, &self.config.routers);

        self.traversals.insert(id, traversal);
        self.pending.insert(id, action);
        self.pump_traversal(id).await
    }

    // Issue the traversal's next queries and resolve it when done.
    async fn pump_traversal(&mut self, id: u32) -> Result<()> {
        let Some(traversal) = self.traversals.get_mut(&id) else {
            return Ok(());
        };

        let method = match traversal.kind {
            TraversalKind::FindNode => "find_node",
            TraversalKind::GetPeers => "get_peers",
        };
        let target = traversal.target();

        for (addr, node_id) in traversal.next_queries() {
            let mut args = KrpcArgs::default();
            match method {
                "find_node" => args.target = Some(ByteBuf::from(target.0.to_vec())),
                _ => args.info_hash = Some(ByteBuf::from(target.0.to_vec())),
            }
            self.send_query(id, addr, node_id, method, args).await.ok();
        }

        let Some(traversal) = self.traversals.get_mut(&id) else {
            return Ok(());
        };
        if traversal.check_done() {
            self.finish_traversal(id).await?;
        }
        Ok(())
    }

    async fn finish_traversal(&mut self, id: u32) -> Result<()> {
        let Some(traversal) = self.traversals.remove(&id) else {
            return Ok(());
        };
        self.rpc.abort_traversal(id);

        match self.pending.remove(&id) {

            Some(PendingAction::Bootstrap) => {
                tracing::info!("dht bootstrap complete, {} nodes", self.routing.num_nodes());
                self.alert_tx.send(Alert::DhtBootstrap {
                    num_nodes: self.routing.num_nodes(),
                }).ok();
            }

            Some(PendingAction::Refresh) | None => {}

            Some(PendingAction::GetPeers { tx }) => {
                tx.send(traversal.peers().to_vec()).ok();
            }

            Some(PendingAction::Announce { info_hash, port, tx }) => {
                // Announce to the closest live nodes that gave us a
                // write token.
                for (_, addr) in traversal.closest_alive() {
                    let Some(token) = traversal.token_for(&addr) else {
                        continue;
                    };
                    let args = KrpcArgs {
                        info_hash: Some(ByteBuf::from(info_hash.to_vec())),
                        port: Some(port),
                        token: Some(ByteBuf::from(token.clone())),
                        ..Default::default()
                    };
                    self.send_query(NO_TRAVERSAL, addr, None, "announce_peer", args).await.ok();
                }
                tx.send(traversal.peers().to_vec()).ok();
            }
        }

        Ok(())
    }

    async fn send_query(
        &mut self,
        traversal_id: u32,
        addr: SocketAddr,
        node_id: Option<NodeId>,
        method: &str,
        mut args: KrpcArgs,
    ) -> Result<()> {
        let txid = self.rpc.register(traversal_id, addr, node_id, Instant::now());
        args.id = ByteBuf::from(self.routing.own_id().0.to_vec());
        let msg = KrpcMessage::query(txid, method, args);
        self.socket.send_to(&msg.to_bytes()?, addr).await?;
        Ok(())
    }

    async fn handle_datagram(&mut self, raw: &[u8], from: SocketAddr) -> Result<()> {
        let msg = KrpcMessage::from_bytes(raw)?;
        match msg.y.as_str() {
            "r" => self.handle_response(msg, from).await,
            "q" => self.handle_query(msg, from).await,
            "e" => {
                if let Some(txid) = msg.txid() {
                    if let Some((observer, _)) = self.rpc.incoming(txid, from, Instant::now()) {
                        tracing::debug!("dht error reply from {}: {:?}", from, msg.e);
                        if let Some(traversal) = self.traversals.get_mut(&observer.traversal_id) {
                            traversal.failed(from);
                        }
                        self.pump_traversal(observer.traversal_id).await?;
                    }
                }
                Ok(())
            }
            other => {
                tracing::trace!("unknown krpc type {:?} from {}", other, from);
                Ok(())
            }
        }
    }

    async fn handle_response(&mut self, msg: KrpcMessage, from: SocketAddr) -> Result<()> {
        let Some(txid) = msg.txid() else {
            return Ok(());
        };
        let Some((observer, rtt)) = self.rpc.incoming(txid, from, Instant::now()) else {
            return Ok(());
        };
        let Some(resp) = msg.r else {
            return Ok(());
        };
        let Some(node_id) = NodeId::from_bytes(&resp.id) else {
            return Ok(());
        };

        if self.config.enforce_node_id && !node_id.matches_endpoint(&from.ip()) {
            tracing::debug!("node id of {} fails the derivation check", from);
            if let Some(traversal) = self.traversals.get_mut(&observer.traversal_id) {
                traversal.failed(from);
                self.pump_traversal(observer.traversal_id).await?;
            }
            return Ok(());
        }

        self.routing.node_seen(node_id, from, rtt);

        let Some(traversal) = self.traversals.get_mut(&observer.traversal_id) else {
            return Ok(());
        };

        if let Some(nodes) = resp.nodes.as_ref() {
            for (id, addr) in krpc::decode_nodes(nodes) {
                self.routing.heard_about(id, addr);
                traversal.add_entry(Some(id), addr, false);
            }
        }
        if let Some(values) = resp.values.as_ref() {
            traversal.add_peers(krpc::decode_peers(values));
        }
        if let Some(token) = resp.token {
            traversal.add_token(from, token.to_vec());
        }

        traversal.finished(from, node_id);
        self.pump_traversal(observer.traversal_id).await
    }

    async fn handle_query(&mut self, msg: KrpcMessage, from: SocketAddr) -> Result<()> {
        let Some(args) = msg.a else {
            let err = KrpcMessage::error(&msg.t, 203, "missing arguments");
            self.socket.send_to(&err.to_bytes()?, from).await?;
            return Ok(());
        };
        if let Some(id) = NodeId::from_bytes(&args.id) {
            self.routing.heard_about(id, from);
        }

        let own_id = ByteBuf::from(self.routing.own_id().0.to_vec());
        let resp = match msg.q.as_deref() {

            Some("ping") => KrpcResponse { id: own_id, ..Default::default() },

            Some("find_node") => {
                let target = args
                    .target
                    .as_ref()
                    .and_then(|t| NodeId::from_bytes(t))
                    .unwrap_or_else(|| self.routing.own_id());
                let nodes: Vec<(NodeId, SocketAddr)> = self
                    .routing
                    .closest(&target, BUCKET_SIZE)
                    .into_iter()
                    .map(|n| (n.id, n.addr))
                    .collect();
                KrpcResponse {
                    id: own_id,
                    nodes: Some(ByteBuf::from(krpc::encode_nodes(&nodes))),
                    ..Default::default()
                }
            }

            Some("get_peers") => {
                let info_hash: Option<ID> = args
                    .info_hash
                    .as_ref()
                    .and_then(|h| h.as_slice().try_into().ok());
                let values = info_hash
                    .and_then(|h| self.stored_peers.get(&h))
                    .map(|peers| peers.iter().filter_map(krpc::encode_peer).collect::<Vec<_>>())
                    .filter(|v: &Vec<ByteBuf>| !v.is_empty());
                let target = info_hash.map(NodeId).unwrap_or_else(|| self.routing.own_id());
                let nodes: Vec<(NodeId, SocketAddr)> = self
                    .routing
                    .closest(&target, BUCKET_SIZE)
                    .into_iter()
                    .map(|n| (n.id, n.addr))
                    .collect();
                KrpcResponse {
                    id: own_id,
                    nodes: Some(ByteBuf::from(krpc::encode_nodes(&nodes))),
                    values,
                    token: Some(ByteBuf::from(self.issue_token(from))),
                }
            }

            Some("announce_peer") => {
                let token_ok = args
                    .token
                    .as_ref()
                    .map(|t| self.issued_tokens.get(&from).map(|v| v.as_slice()) == Some(t.as_slice()))
                    .unwrap_or(false);
                if !token_ok {
                    let err = KrpcMessage::error(&msg.t, 203, "bad token");
                    self.socket.send_to(&err.to_bytes()?, from).await?;
                    return Ok(());
                }
                let info_hash: Option<ID> = args
                    .info_hash
                    .as_ref()
                    .and_then(|h| h.as_slice().try_into().ok());
                if let Some(info_hash) = info_hash {
                    let port = if args.implied_port == Some(1) {
                        from.port()
                    } else {
                        args.port.unwrap_or(from.port())
                    };
                    let peers = self.stored_peers.entry(info_hash).or_default();
                    let peer = SocketAddr::new(from.ip(), port);
                    if !peers.contains(&peer) {
                        peers.push(peer);
                        if peers.len() > MAX_STORED_PEERS {
                            peers.remove(0);
                        }
                    }
                }
                KrpcResponse { id: own_id, ..Default::default() }
            }

            other => {
                tracing::trace!("unknown query {:?} from {}", other, from);
                let err = KrpcMessage::error(&msg.t, 204, "method unknown");
                self.socket.send_to(&err.to_bytes()?, from).await?;
                return Ok(());
            }
        };

        let reply = KrpcMessage::response(&msg.t, resp);
        self.socket.send_to(&reply.to_bytes()?, from).await?;
        Ok(())
    }

    fn issue_token(&mut self, from: SocketAddr) -> Vec<u8> {
        let token: [u8; 8] = rand::thread_rng().gen();
        self.issued_tokens.insert(from, token.to_vec());
        token.to_vec()
    }

    async fn tick(&mut self) -> Result<()> {
        let events = self.rpc.tick(Instant::now());
        let mut touched = Vec::new();

        for event in events {
            if let Some(traversal) = self.traversals.get_mut(&event.traversal_id) {
                match event.kind {
                    TimeoutKind::Short => traversal.short_timeout(event.endpoint),
                    TimeoutKind::Hard => {
                        traversal.failed(event.endpoint);
                        if let Some(id) = event.node_id {
                            self.routing.node_failed(id);
                        }
                    }
                }
                touched.push(event.traversal_id);
            } else if event.kind == TimeoutKind::Hard {
                if let Some(id) = event.node_id {
                    self.routing.node_failed(id);
                }
            }
        }

        touched.sort_unstable();
        touched.dedup();
        for id in touched {
            self.pump_traversal(id).await?;
        }

        // Walk quiet buckets back to health.
        let targets = self.routing.refresh_targets(Instant::now());
        for target in targets {
            self.start_traversal(target, TraversalKind::FindNode, PendingAction::Refresh).await?;
        }

        Ok(())
    }
}

pub fn spawn(
    mut dht: Dht,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let result = dht.run().await;
        if let Err(e) = &result {
            tracing::error!("dht task error: {}", e);
        }
        result
    })
}
