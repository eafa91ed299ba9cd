use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use bytes::BytesMut;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    time,
};
use tokio_util::codec::Decoder;
use crate::{
    alert::Alert,
    config::{Config, TorrentConfig},
    dht::{self, Dht, DhtCommand, DhtConfig, DhtTx},
    p2p::{Handshake, HandshakeCodec},
    storage::{MetainfoOps, PortMapper, PortProto, Resolver, Storage},
    torrent::{SessionLimits, TorrentCommand, TorrentHandle, TorrentParams},
    AlertRx, AlertTx, ID,
};

pub type SessionTx = mpsc::UnboundedSender<SessionCommand>;
type SessionRx = mpsc::UnboundedReceiver<SessionCommand>;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for SessionError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        SessionError::Channel(e.to_string())
    }
}

type Result<T> = std::result::Result<T, SessionError>;

pub enum SessionCommand {

    AddTorrent {
        metainfo: Arc<dyn MetainfoOps>,
        storage: Arc<dyn Storage>,
        config: TorrentConfig,
        tx: oneshot::Sender<TorrentHandle>,
    },

    RemoveTorrent(ID),

    // Inbound connection with its handshake, read by the acceptor task.
    Inbound {
        stream: TcpStream,
        address: SocketAddr,
        handshake: Handshake,
    },

    Shutdown,

}

// The ambient context of the engine: one listen socket, one DHT node,
// one pair of rate-limit channels, shared by every torrent.
pub struct Session {

    config: Arc<Config>,

    torrents: HashMap<ID, TorrentHandle>,

    limits: Arc<SessionLimits>,

    session_rx: SessionRx,

    session_tx: SessionTx,

    alert_tx: AlertTx,

    dht_tx: Option<DhtTx>,

    dht_handle: Option<tokio::task::JoinHandle<dht::Result<()>>>,

    port_mapper: Option<Arc<dyn PortMapper>>,

    resolver: Option<Arc<dyn Resolver>>,

    listener: Option<TcpListener>,

    bound: bool,

    // The actually-bound listen port, known after bind.
    listen_port: u16,

}

impl Session {

    pub fn new(config: Config) -> (Self, SessionTx, AlertRx) {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let limits = Arc::new(SessionLimits::new(
            config.upload_rate_limit,
            config.download_rate_limit,
        ));
        let listen_port = config.listen_address.port();
        (
            Session {
                config: Arc::new(config),
                torrents: HashMap::new(),
                limits,
                session_rx,
                session_tx: session_tx.clone(),
                alert_tx,
                dht_tx: None,
                dht_handle: None,
                port_mapper: None,
                resolver: None,
                listener: None,
                bound: false,
                listen_port,
            },
            session_tx,
            alert_rx,
        )
    }

    pub fn with_port_mapper(mut self, mapper: Arc<dyn PortMapper>) -> Self {
        self.port_mapper = Some(mapper);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    // Bind the listen socket and start the DHT. Safe to call ahead of
    // run() when the caller needs the effective port first.
    pub async fn bind(&mut self) -> Result<()> {
        if self.bound {
            return Ok(());
        }
        self.bound = true;

        // A dead listener degrades the session to outbound-only.
        match TcpListener::bind(self.config.listen_address).await {
            Ok(listener) => {
                self.listen_port = listener.local_addr()?.port();
                tracing::info!("listening on port {}", self.listen_port);
                self.listener = Some(listener);
            }
            Err(e) => {
                tracing::error!("listen socket failed: {}", e);
                self.alert_tx.send(Alert::ListenFailed {
                    address: self.config.listen_address,
                    msg: e.to_string(),
                }).ok();
            }
        }

        if let Some(mapper) = &self.port_mapper {
            mapper.map(self.listen_port, PortProto::Tcp);
            mapper.map(self.listen_port, PortProto::Udp);
        }

        self.start_dht().await;
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "session")]
    pub async fn run(&mut self) -> Result<()> {

        self.bind().await?;
        let listener = self.listener.take();

        loop { tokio::select! {

            conn = accept(&listener), if listener.is_some() => {
                if let Some((stream, address)) = conn {
                    self.spawn_handshake_read(stream, address);
                }
            }

            Some(cmd) = self.session_rx.recv() => {
                match cmd {

                    SessionCommand::AddTorrent { metainfo, storage, config, tx } => {
                        let handle = self.add_torrent(metainfo, storage, config);
                        tx.send(handle).ok();
                    }

                    SessionCommand::RemoveTorrent(id) => {
                        if let Some(torrent) = self.torrents.remove(&id) {
                            torrent.torrent_tx.send(TorrentCommand::Shutdown).ok();
                        } else {
                            tracing::warn!("attempted to remove non-existent torrent: {}", hex::encode(id));
                        }
                    }

                    SessionCommand::Inbound { stream, address, handshake } => {
                        match self.torrents.get(&handshake.info_hash) {
                            Some(torrent) => {
                                torrent.torrent_tx.send(TorrentCommand::InboundPeer {
                                    stream,
                                    address,
                                    handshake,
                                }).ok();
                            }
                            None => {
                                tracing::debug!(
                                    "inbound peer {} for unknown torrent {}",
                                    address,
                                    hex::encode(&handshake.info_hash[..4]),
                                );
                            }
                        }
                    }

                    SessionCommand::Shutdown => break,

                }
            }

        }}

        self.shutdown().await;
        Ok(())
    }

    fn add_torrent(
        &mut self,
        metainfo: Arc<dyn MetainfoOps>,
        storage: Arc<dyn Storage>,
        torrent_config: TorrentConfig,
    ) -> TorrentHandle {
        let handle = TorrentHandle::start_torrent(TorrentParams {
            metainfo,
            storage,
            config: self.config.clone(),
            torrent_config,
            alert_tx: self.alert_tx.clone(),
            listen_port: self.listen_port,
            limits: self.limits.clone(),
            dht_tx: self.dht_tx.clone(),
            resolver: self.resolver.clone(),
        });
        let control = TorrentHandle {
            info_hash: handle.info_hash,
            torrent_tx: handle.torrent_tx.clone(),
            handle: None,
        };
        self.torrents.insert(handle.info_hash, handle);
        control
    }

    async fn start_dht(&mut self) {
        if !self.config.enable_dht {
            return;
        }
        let dht_config = DhtConfig {
            enforce_node_id: self.config.dht_enforce_node_id,
            restrict_search_ips: self.config.dht_restrict_search_ips,
            aggressive_lookups: self.config.dht_aggressive_lookups,
            routers: self.config.dht_routers.clone(),
        };
        // The DHT shares the listen port, on UDP.
        let bind_addr = SocketAddr::new(self.config.listen_address.ip(), self.listen_port);
        match Dht::bind(bind_addr, dht_config, self.alert_tx.clone()).await {
            Ok((dht, dht_tx)) => {
                let routers = self.config.dht_routers.clone();
                if !routers.is_empty() {
                    dht_tx.send(DhtCommand::Bootstrap(routers)).ok();
                }
                self.dht_handle = Some(dht::spawn(dht));
                self.dht_tx = Some(dht_tx);
            }
            Err(e) => {
                tracing::error!("dht failed to start: {}", e);
            }
        }
    }

    // Pull the 68-byte handshake off an inbound connection so it can be
    // routed to the right torrent.
    fn spawn_handshake_read(&self, mut stream: TcpStream, address: SocketAddr) {
        let session_tx = self.session_tx.clone();
        let deadline = self.config.handshake_timeout;
        tokio::spawn(async move {
            let mut buf = [0u8; 68];
            let read = time::timeout(deadline, stream.read_exact(&mut buf)).await;
            match read {
                Ok(Ok(_)) => {
                    let mut bytes = BytesMut::from(&buf[..]);
                    match HandshakeCodec.decode(&mut bytes) {
                        Ok(Some(handshake)) => {
                            session_tx.send(SessionCommand::Inbound {
                                stream,
                                address,
                                handshake,
                            }).ok();
                        }
                        _ => tracing::debug!("bad handshake from {}", address),
                    }
                }
                _ => tracing::debug!("inbound handshake timed out from {}", address),
            }
        });
    }

    async fn shutdown(&mut self) {
        tracing::info!("session shutting down");
        for torrent in self.torrents.values() {
            torrent.torrent_tx.send(TorrentCommand::Shutdown).ok();
        }
        for (_, mut torrent) in self.torrents.drain() {
            if let Some(handle) = torrent.handle.take() {
                handle.await.ok();
            }
        }
        if let Some(dht_tx) = &self.dht_tx {
            dht_tx.send(DhtCommand::Shutdown).ok();
        }
        if let Some(handle) = self.dht_handle.take() {
            handle.await.ok();
        }
        if let Some(mapper) = &self.port_mapper {
            mapper.unmap(self.listen_port, PortProto::Tcp);
            mapper.unmap(self.listen_port, PortProto::Udp);
        }
    }
}

async fn accept(listener: &Option<TcpListener>) -> Option<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => match listener.accept().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!("inbound peer connection error: {}", e);
                None
            }
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::storage::{StorageError, StorageResult};

    // Content-addressed test fixture: the "hash" is a cheap digest the
    // storage and metainfo agree on, standing in for the real hashing
    // pipeline that lives outside the engine.
    fn digest(data: &[u8]) -> ID {
        let mut h = [0u8; 20];
        for (i, b) in data.iter().enumerate() {
            h[i % 20] = h[i % 20].wrapping_add(b.wrapping_mul(31) ^ i as u8);
        }
        h
    }

    const PIECE_LEN: usize = 8 * 1024;
    const NUM_PIECES: usize = 13;

    fn content() -> Vec<u8> {
        (0..PIECE_LEN * NUM_PIECES)
            .map(|i| (i * 7 + 13) as u8)
            .collect()
    }

    struct MemStorage {
        pieces: Mutex<Vec<Vec<u8>>>,
    }

    impl MemStorage {
        fn seeded() -> Self {
            let content = content();
            Self {
                pieces: Mutex::new(
                    content.chunks(PIECE_LEN).map(|c| c.to_vec()).collect(),
                ),
            }
        }

        fn empty() -> Self {
            Self {
                pieces: Mutex::new(vec![vec![0; PIECE_LEN]; NUM_PIECES]),
            }
        }
    }

    #[async_trait::async_trait]
    impl Storage for MemStorage {

        async fn read_block(&self, piece: usize, offset: usize, len: usize) -> StorageResult<Vec<u8>> {
            let pieces = self.pieces.lock().unwrap();
            let piece = pieces.get(piece).ok_or(StorageError::InvalidPiece(piece))?;
            Ok(piece[offset..offset + len].to_vec())
        }

        async fn write_block(&self, piece: usize, offset: usize, data: Vec<u8>) -> StorageResult<()> {
            let mut pieces = self.pieces.lock().unwrap();
            let piece = pieces.get_mut(piece).ok_or(StorageError::InvalidPiece(piece))?;
            piece[offset..offset + data.len()].copy_from_slice(&data);
            Ok(())
        }

        async fn hash_piece(&self, piece: usize) -> StorageResult<ID> {
            let pieces = self.pieces.lock().unwrap();
            let piece = pieces.get(piece).ok_or(StorageError::InvalidPiece(piece))?;
            Ok(digest(piece))
        }
    }

    struct Meta;

    impl MetainfoOps for Meta {
        fn info_hash(&self) -> ID {
            [0x77; 20]
        }
        fn num_pieces(&self) -> usize {
            NUM_PIECES
        }
        fn piece_length(&self, _idx: usize) -> usize {
            PIECE_LEN
        }
        fn piece_hash(&self, idx: usize) -> ID {
            digest(&content()[idx * PIECE_LEN..(idx + 1) * PIECE_LEN])
        }
        fn total_size(&self) -> u64 {
            (NUM_PIECES * PIECE_LEN) as u64
        }
        fn trackers(&self) -> Vec<Vec<url::Url>> {
            Vec::new()
        }
    }

    fn test_config() -> Config {
        Config {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            // Keep the choker responsive for the test clock.
            unchoke_interval: Duration::from_secs(1),
            enable_dht: false,
            ..Default::default()
        }
    }

    async fn spawn_session() -> (SessionTx, AlertRx, u16) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (mut session, tx, alert_rx) = Session::new(test_config());
        session.bind().await.unwrap();
        let port = session.listen_port();
        assert_ne!(port, 0, "session never bound its listener");
        tokio::spawn(async move { session.run().await });
        (tx, alert_rx, port)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_seed_to_leech_transfer() {
        let (seed_tx, _seed_alerts, seed_port) = spawn_session().await;
        let (leech_tx, mut leech_alerts, _leech_port) = spawn_session().await;

        // Seed has the full content on disk.
        let (tx, rx) = oneshot::channel();
        seed_tx.send(SessionCommand::AddTorrent {
            metainfo: Arc::new(Meta),
            storage: Arc::new(MemStorage::seeded()),
            config: TorrentConfig::default(),
            tx,
        }).unwrap();
        let _seed_handle = rx.await.unwrap();

        let (tx, rx) = oneshot::channel();
        leech_tx.send(SessionCommand::AddTorrent {
            metainfo: Arc::new(Meta),
            storage: Arc::new(MemStorage::empty()),
            config: TorrentConfig::default(),
            tx,
        }).unwrap();
        let leech_handle = rx.await.unwrap();

        // Point the leecher at the seed.
        let seed_addr: SocketAddr = format!("127.0.0.1:{}", seed_port).parse().unwrap();
        leech_handle.add_peers(vec![seed_addr]);

        // The whole 104 KiB torrent should transfer comfortably within
        // the deadline.
        let finished = time::timeout(Duration::from_secs(60), async {
            loop {
                match leech_alerts.recv().await {
                    Some(Alert::TorrentFinished { .. }) => break true,
                    Some(Alert::HashFailed { .. }) => break false,
                    Some(_) => continue,
                    None => break false,
                }
            }
        })
        .await;

        assert!(matches!(finished, Ok(true)), "leech did not complete the torrent");

        seed_tx.send(SessionCommand::Shutdown).ok();
        leech_tx.send(SessionCommand::Shutdown).ok();
    }

    #[tokio::test]
    async fn test_listen_failure_surfaces_alert() {
        // Grab a port, then ask a session to bind the same one.
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let mut config = test_config();
        config.listen_address = addr;
        let (mut session, tx, mut alert_rx) = Session::new(config);
        tokio::spawn(async move { session.run().await });

        match time::timeout(Duration::from_secs(5), alert_rx.recv()).await {
            Ok(Some(Alert::ListenFailed { address, .. })) => assert_eq!(address, addr),
            other => panic!("expected ListenFailed, got {:?}", other.map(|_| ())),
        }
        tx.send(SessionCommand::Shutdown).ok();
    }
}
