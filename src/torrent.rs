use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::{net::TcpStream, sync::{mpsc, oneshot}, time};
use crate::{
    alert::Alert,
    bandwidth::{BandwidthLimiter, Channel, Direction},
    block::BlockInfo,
    choker::{ChokeCandidate, Choker, ChokerSettings, Unchokes},
    config::{Config, TorrentConfig},
    dht::{DhtCommand, DhtTx},
    p2p::{state::ConnState, Handshake, PeerCommand, PeerHandle, state::SessionState},
    picker::Picker,
    stats::{PieceStats, TorrentStats},
    storage::{MetainfoOps, Resolver, Storage, StorageResult},
    tracker::{AnnounceParams, Event, TrackerSet},
    AlertTx, ID,
};

// DHT lookups for more peers run on this cadence.
const DHT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

// Overall deadline for one tracker walk, so a slow tier can't stall the
// torrent loop for long.
const ANNOUNCE_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;
pub type TorrentRx = mpsc::UnboundedReceiver<TorrentCommand>;

// Session-wide rate limit channels, shared by every torrent's limiters.
#[derive(Debug)]
pub struct SessionLimits {

    pub up: Mutex<Channel>,

    pub down: Mutex<Channel>,

}

impl SessionLimits {
    pub fn new(up: Option<usize>, down: Option<usize>) -> Self {
        Self {
            up: Mutex::new(Channel::new(up)),
            down: Mutex::new(Channel::new(down)),
        }
    }
}

// Commands that can be sent to a torrent from other tasks.
pub enum TorrentCommand {

    // Sent by peer task when the wire handshake completes.
    PeerConnected { address: SocketAddr, id: ID },

    // Periodic peer state snapshots, and the disconnect notification.
    PeerState { address: SocketAddr, state: SessionState },

    // A block arrived from some peer; others cancel duplicate requests.
    BlockArrived { address: SocketAddr, block: BlockInfo },

    // Every block of the piece is written; hash verification is due.
    PieceComplete { idx: usize },

    // Hash verification outcome, from the spawned check.
    PieceVerified { idx: usize, valid: bool },

    // A peer session wants rate-limiter quota.
    RequestBandwidth { address: SocketAddr, direction: Direction, bytes: usize },

    // Storage gave up on a read or write.
    FileError { msg: String },

    // A peer advertised its DHT port.
    DhtNode(SocketAddr),

    // Fresh peer endpoints from tracker or DHT.
    Peers(Vec<SocketAddr>),

    // Inbound connection with its already-read handshake.
    InboundPeer { stream: TcpStream, address: SocketAddr, handshake: Handshake },

    Pause,

    Resume,

    AnnounceNow,

    SetPriority { piece: usize, priority: u8 },

    ReadPiece { idx: usize, tx: oneshot::Sender<StorageResult<Vec<u8>>> },

    Shutdown,

}

// Read-only state shared with every peer session of the torrent.
#[derive(Debug)]
pub struct TorrentContext {

    pub info_hash: ID,

    pub client_id: ID,

    pub picker: Picker,

    pub torrent_tx: TorrentTx,

    pub storage: Arc<dyn Storage>,

    pub config: Arc<Config>,

    pub num_pieces: usize,

    pub piece_len: usize,

    pub last_piece_len: usize,

    pub total_len: u64,

    pub listen_port: u16,

    // Whether sessions must meter their sends through the limiter.
    pub rate_limited_up: bool,

    pub rate_limited_down: bool,

    // Set on storage failure: serve only, stop requesting.
    pub upload_only: AtomicBool,

}

impl std::fmt::Debug for dyn Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Storage")
    }
}

impl TorrentContext {
    pub fn piece_len(&self, idx: usize) -> usize {
        if idx + 1 == self.num_pieces {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }
}

pub struct TorrentParams {

    pub metainfo: Arc<dyn MetainfoOps>,

    pub storage: Arc<dyn Storage>,

    pub config: Arc<Config>,

    pub torrent_config: TorrentConfig,

    pub alert_tx: AlertTx,

    pub listen_port: u16,

    pub limits: Arc<SessionLimits>,

    pub dht_tx: Option<DhtTx>,

    pub resolver: Option<Arc<dyn Resolver>>,

}

#[derive(Debug)]
struct PeerSlot {

    handle: PeerHandle,

    trust_points: i16,

    on_parole: bool,

    priority: u8,

    connected_at: Instant,

}

pub struct Torrent {

    ctx: Arc<TorrentContext>,

    metainfo: Arc<dyn MetainfoOps>,

    torrent_config: TorrentConfig,

    alert_tx: AlertTx,

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerSlot>,

    // Peers we know about but don't have a session with.
    available: Vec<SocketAddr>,

    banned: HashSet<IpAddr>,

    trackers: TrackerSet,

    choker: Choker,

    upload_limiter: BandwidthLimiter,

    download_limiter: BandwidthLimiter,

    limits: Arc<SessionLimits>,

    dht_tx: Option<DhtTx>,

    torrent_rx: TorrentRx,

    torrent_tx: TorrentTx,

    start_time: Option<Instant>,

    last_dht_announce: Option<Instant>,

    // HAVE announcements batched between ticks.
    have_queue: Vec<usize>,

    // Seconds since the choker last ran.
    choke_counter: u64,

    paused: bool,

    // Counters for the stats alert and tracker reports.
    uploaded: u64,

    downloaded: u64,

}

impl Torrent {

    pub fn new(params: TorrentParams) -> (Self, TorrentTx) {
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let metainfo = params.metainfo;
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_length(0);
        let last_piece_len = metainfo.piece_length(num_pieces.saturating_sub(1));

        let ctx = Arc::new(TorrentContext {
            info_hash: metainfo.info_hash(),
            client_id: params.config.client_id,
            picker: Picker::new(num_pieces, piece_len, last_piece_len),
            torrent_tx: torrent_tx.clone(),
            storage: params.storage,
            num_pieces,
            piece_len,
            last_piece_len,
            total_len: metainfo.total_size(),
            listen_port: params.listen_port,
            rate_limited_up: params.config.upload_rate_limit.is_some()
                || params.torrent_config.upload_rate_limit.is_some(),
            rate_limited_down: params.config.download_rate_limit.is_some()
                || params.torrent_config.download_rate_limit.is_some(),
            upload_only: AtomicBool::new(false),
            config: params.config,
        });

        let trackers = TrackerSet::new(
            metainfo.trackers(),
            ctx.config.announce_to_all_tiers,
            ctx.config.announce_to_all_trackers,
            params.resolver,
        );

        (
            Torrent {
                upload_limiter: BandwidthLimiter::new(params.torrent_config.upload_rate_limit),
                download_limiter: BandwidthLimiter::new(params.torrent_config.download_rate_limit),
                torrent_config: params.torrent_config,
                metainfo,
                alert_tx: params.alert_tx,
                peers: HashMap::new(),
                available: Vec::new(),
                banned: HashSet::new(),
                trackers,
                choker: Choker::new(),
                limits: params.limits,
                dht_tx: params.dht_tx,
                torrent_rx,
                torrent_tx: torrent_tx.clone(),
                start_time: None,
                last_dht_announce: None,
                have_queue: Vec::new(),
                choke_counter: 0,
                paused: false,
                uploaded: 0,
                downloaded: 0,
                ctx,
            },
            torrent_tx,
        )
    }

    #[tracing::instrument(skip_all, name = "torrent", fields(info_hash = %hex::encode(&self.ctx.info_hash[..4])))]
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("starting torrent");
        self.start_time = Some(Instant::now());
        self.ctx
            .picker
            .write()
            .await
            .set_sequential_threshold(self.torrent_config.sequential_threshold);
        self.check_existing_data().await;
        self.announce(Some(Event::Started)).await;
        self.request_dht_peers();
        self.connect_to_peers();

        let mut ticker = time::interval(Duration::from_secs(1));

        loop { tokio::select! {

            Some(cmd) = self.torrent_rx.recv() => {
                if self.handle_command(cmd).await? {
                    break;
                }
            }

            t = ticker.tick() => self.tick(t.into_std()).await?,

        }}

        self.shutdown().await;
        Ok(())
    }

    // Recheck on add: pieces already on disk don't need downloading.
    async fn check_existing_data(&mut self) {
        let mut have = Vec::new();
        for idx in 0..self.ctx.num_pieces {
            match self.ctx.storage.hash_piece(idx).await {
                Ok(hash) if hash == self.metainfo.piece_hash(idx) => have.push(idx),
                _ => {}
            }
        }
        if !have.is_empty() {
            tracing::info!("{} pieces already on disk", have.len());
            let mut picker = self.ctx.picker.write().await;
            for idx in have {
                picker.we_have(idx);
            }
        }
    }

    // Returns true on shutdown.
    async fn handle_command(&mut self, cmd: TorrentCommand) -> Result<bool> {
        match cmd {

            TorrentCommand::PeerConnected { address, id } => {
                // One connection per peer id; a second handshake with a
                // known id is dropped.
                let duplicate = self
                    .peers
                    .iter()
                    .any(|(a, s)| *a != address && s.handle.id == Some(id));
                if duplicate || id == self.ctx.client_id {
                    tracing::debug!("dropping duplicate peer {}", address);
                    if let Some(slot) = self.peers.get(&address) {
                        slot.handle.peer_tx.send(PeerCommand::Shutdown).ok();
                    }
                    return Ok(false);
                }
                if let Some(slot) = self.peers.get_mut(&address) {
                    slot.handle.id = Some(id);
                }
                self.alert_tx.send(Alert::PeerConnected {
                    info_hash: self.ctx.info_hash,
                    address,
                }).ok();
            }

            TorrentCommand::PeerState { address, state } => {
                if let Some(slot) = self.peers.get_mut(&address) {
                    self.uploaded += state.throughput.up.round();
                    self.downloaded += state.throughput.down.round();
                    slot.handle.state = state;
                }
            }

            TorrentCommand::BlockArrived { address, block } => {
                for (peer_address, slot) in self.peers.iter() {
                    if *peer_address != address {
                        slot.handle.peer_tx.send(PeerCommand::BlockArrived(block)).ok();
                    }
                }
            }

            TorrentCommand::PieceComplete { idx } => {
                self.spawn_hash_check(idx);
            }

            TorrentCommand::PieceVerified { idx, valid } => {
                self.handle_piece_verified(idx, valid).await?;
            }

            TorrentCommand::RequestBandwidth { address, direction, bytes } => {
                let limiter = match direction {
                    Direction::Up => &mut self.upload_limiter,
                    Direction::Down => &mut self.download_limiter,
                };
                if !limiter.is_queued(address) {
                    limiter.request(address, self.ctx.info_hash, bytes, false);
                }
                self.dispatch_bandwidth(Instant::now());
            }

            TorrentCommand::FileError { msg } => {
                tracing::error!("storage failure, entering upload-only mode: {}", msg);
                self.ctx.upload_only.store(true, Ordering::Relaxed);
                self.alert_tx.send(Alert::FileError {
                    info_hash: self.ctx.info_hash,
                    msg,
                }).ok();
            }

            TorrentCommand::DhtNode(addr) => {
                if let Some(dht_tx) = &self.dht_tx {
                    dht_tx.send(DhtCommand::AddNode(addr)).ok();
                }
            }

            TorrentCommand::Peers(peers) => {
                self.add_available(peers);
                self.connect_to_peers();
            }

            TorrentCommand::InboundPeer { stream, address, handshake } => {
                self.accept_peer(stream, address, handshake);
            }

            TorrentCommand::Pause => {
                if !self.paused {
                    self.paused = true;
                    tracing::info!("torrent paused");
                    self.disconnect_all();
                    self.announce(Some(Event::Stopped)).await;
                }
            }

            TorrentCommand::Resume => {
                if self.paused {
                    self.paused = false;
                    tracing::info!("torrent resumed");
                    self.announce(Some(Event::Started)).await;
                    self.connect_to_peers();
                }
            }

            TorrentCommand::AnnounceNow => {
                self.announce(None).await;
            }

            TorrentCommand::SetPriority { piece, priority } => {
                self.ctx.picker.write().await.set_priority(piece, priority);
            }

            TorrentCommand::ReadPiece { idx, tx } => {
                let storage = self.ctx.storage.clone();
                let len = self.ctx.piece_len(idx);
                tokio::spawn(async move {
                    let result = storage.read_block(idx, 0, len).await;
                    tx.send(result).ok();
                });
            }

            TorrentCommand::Shutdown => return Ok(true),

        }
        Ok(false)
    }

    fn accept_peer(&mut self, stream: TcpStream, address: SocketAddr, handshake: Handshake) {
        if self.paused || self.banned.contains(&address.ip()) {
            return;
        }
        // One connection per IP, unless configured otherwise.
        if !self.torrent_config.allow_multiple_connections_per_ip
            && self.peers.keys().any(|a| a.ip() == address.ip())
        {
            tracing::debug!("rejecting second connection from {}", address.ip());
            return;
        }
        if self.peers.len() >= self.torrent_config.min_max_peers.1 as usize {
            return;
        }
        let handle = PeerHandle::start_session(address, self.ctx.clone(), Some((stream, handshake)));
        self.peers.insert(address, PeerSlot {
            handle,
            trust_points: 0,
            on_parole: false,
            priority: 1,
            connected_at: Instant::now(),
        });
    }

    fn add_available(&mut self, peers: Vec<SocketAddr>) {
        for addr in peers {
            if self.banned.contains(&addr.ip())
                || self.peers.contains_key(&addr)
                || self.available.contains(&addr)
            {
                continue;
            }
            self.available.push(addr);
        }
    }

    fn connect_to_peers(&mut self) {
        if self.paused {
            return;
        }
        let count = self
            .available
            .len()
            .min((self.torrent_config.min_max_peers.1 as usize).saturating_sub(self.peers.len()));
        if count == 0 {
            return;
        }

        tracing::debug!("connecting to {} peers", count);
        for address in self.available.drain(0..count) {
            let handle = PeerHandle::start_session(address, self.ctx.clone(), None);
            self.peers.insert(address, PeerSlot {
                handle,
                trust_points: 0,
                on_parole: false,
                priority: 1,
                connected_at: Instant::now(),
            });
        }
    }

    fn spawn_hash_check(&self, idx: usize) {
        let storage = self.ctx.storage.clone();
        let expected = self.metainfo.piece_hash(idx);
        let torrent_tx = self.torrent_tx.clone();
        tokio::spawn(async move {
            let valid = match storage.hash_piece(idx).await {
                Ok(hash) => hash == expected,
                Err(e) => {
                    tracing::error!("hash check failed to run: {}", e);
                    false
                }
            };
            torrent_tx.send(TorrentCommand::PieceVerified { idx, valid }).ok();
        });
    }

    async fn handle_piece_verified(&mut self, idx: usize, valid: bool) -> Result<()> {
        let contributors = {
            let picker = self.ctx.picker.read().await;
            picker
                .downloading_piece(idx)
                .map(|p| p.contributors())
                .unwrap_or_default()
        };

        if valid {
            self.ctx.picker.write().await.we_have(idx);
            self.have_queue.push(idx);
            self.alert_tx.send(Alert::PieceFinished {
                info_hash: self.ctx.info_hash,
                piece_idx: idx,
            }).ok();

            // A verified piece clears parole and earns trust.
            for addr in contributors {
                if let Some(slot) = self.peers.get_mut(&addr) {
                    slot.trust_points = slot.trust_points.saturating_add(1);
                    if slot.on_parole {
                        slot.on_parole = false;
                        slot.handle.peer_tx.send(PeerCommand::Parole(false)).ok();
                    }
                }
            }

            let is_seed = self.ctx.picker.is_seed().await;
            if is_seed {
                tracing::info!("torrent complete");
                self.alert_tx.send(Alert::TorrentFinished {
                    info_hash: self.ctx.info_hash,
                }).ok();
                self.announce(Some(Event::Completed)).await;
            }
        } else {
            tracing::warn!("piece {} failed hash check", idx);
            self.ctx.picker.write().await.restore_piece(idx);
            self.alert_tx.send(Alert::HashFailed {
                info_hash: self.ctx.info_hash,
                piece_idx: idx,
            }).ok();

            for addr in contributors {
                let Some(slot) = self.peers.get_mut(&addr) else {
                    continue;
                };
                slot.trust_points -= 1;
                if slot.trust_points <= self.ctx.config.ban_threshold {
                    tracing::warn!("banning peer {}", addr);
                    self.banned.insert(addr.ip());
                    slot.handle.peer_tx.send(PeerCommand::Shutdown).ok();
                    self.alert_tx.send(Alert::PeerBanned {
                        info_hash: self.ctx.info_hash,
                        address: addr,
                    }).ok();
                } else if !slot.on_parole {
                    slot.on_parole = true;
                    slot.handle.peer_tx.send(PeerCommand::Parole(true)).ok();
                }
            }
        }

        Ok(())
    }

    async fn announce(&mut self, event: Option<Event>) {
        if self.trackers.is_empty() {
            return;
        }
        let left = {
            let picker = self.ctx.picker.read().await;
            self.ctx.total_len.saturating_sub(picker.finished_bytes())
        };
        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            port: self.ctx.listen_port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left,
            event,
            num_want: Some(self.ctx.config.num_want),
            key: rand::random(),
        };

        let outcome = match time::timeout(
            ANNOUNCE_DEADLINE,
            self.trackers.announce(params, Instant::now()),
        ).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("tracker announce walk timed out");
                return;
            }
        };

        for (url, num_peers) in outcome.replies {
            self.alert_tx.send(Alert::TrackerReply {
                info_hash: self.ctx.info_hash,
                url,
                num_peers,
            }).ok();
        }
        for (url, msg) in outcome.errors {
            self.alert_tx.send(Alert::TrackerError {
                info_hash: self.ctx.info_hash,
                url,
                msg,
            }).ok();
        }

        self.add_available(outcome.peers);
    }

    // Periodic get_peers/announce through the DHT; results come back as
    // a Peers command.
    fn request_dht_peers(&mut self) {
        let Some(dht_tx) = &self.dht_tx else {
            return;
        };
        if self.paused {
            return;
        }
        self.last_dht_announce = Some(Instant::now());
        let (tx, rx) = oneshot::channel();
        let cmd = DhtCommand::Announce {
            info_hash: self.ctx.info_hash,
            port: self.ctx.listen_port,
            tx,
        };
        if dht_tx.send(cmd).is_err() {
            return;
        }
        let torrent_tx = self.torrent_tx.clone();
        let alert_tx = self.alert_tx.clone();
        let info_hash = self.ctx.info_hash;
        tokio::spawn(async move {
            if let Ok(peers) = rx.await {
                alert_tx.send(Alert::DhtReply {
                    info_hash,
                    num_peers: peers.len(),
                }).ok();
                if !peers.is_empty() {
                    torrent_tx.send(TorrentCommand::Peers(peers)).ok();
                }
            }
        });
    }

    // The once-a-second housekeeping pass.
    async fn tick(&mut self, now: Instant) -> Result<()> {

        self.reap_peers().await;
        self.dispatch_bandwidth(now);
        self.flush_haves();

        if !self.paused {
            if self.trackers.announce_due(now) {
                self.announce(None).await;
            }
            if self
                .last_dht_announce
                .map(|at| now.duration_since(at) >= DHT_ANNOUNCE_INTERVAL)
                .unwrap_or(true)
            {
                self.request_dht_peers();
            }
            self.connect_to_peers();

            self.choke_counter += 1;
            if self.choke_counter >= self.ctx.config.unchoke_interval.as_secs() {
                self.choke_counter = 0;
                self.run_choker().await;
            }
        }

        if self.ctx.config.enable_stats_alerts {
            self.alert_tx.send(Alert::Stats(self.stats().await)).ok();
        }

        Ok(())
    }

    // Drop slots whose session task has ended.
    async fn reap_peers(&mut self) {
        let dead: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, slot)| {
                slot.handle
                    .session_handle
                    .as_ref()
                    .map(|h| h.is_finished())
                    .unwrap_or(true)
                    || slot.handle.state.conn_state == ConnState::Disconnected
            })
            .map(|(a, _)| *a)
            .collect();
        for address in dead {
            self.peers.remove(&address);
            self.ctx.picker.write().await.abort_peer(address);
            self.upload_limiter.forfeit(address);
            self.download_limiter.forfeit(address);
            self.alert_tx.send(Alert::PeerDisconnected {
                info_hash: self.ctx.info_hash,
                address,
            }).ok();
        }
    }

    fn dispatch_bandwidth(&mut self, now: Instant) {
        let grants = {
            let mut parent = self.limits.up.lock().unwrap();
            self.upload_limiter.tick(now, Some(&mut parent))
        };
        for grant in grants {
            if let Some(slot) = self.peers.get(&grant.consumer) {
                slot.handle.peer_tx.send(PeerCommand::Bandwidth(Direction::Up, grant.amount)).ok();
            }
        }
        let grants = {
            let mut parent = self.limits.down.lock().unwrap();
            self.download_limiter.tick(now, Some(&mut parent))
        };
        for grant in grants {
            if let Some(slot) = self.peers.get(&grant.consumer) {
                slot.handle.peer_tx.send(PeerCommand::Bandwidth(Direction::Down, grant.amount)).ok();
            }
        }
    }

    fn flush_haves(&mut self) {
        if self.have_queue.is_empty() {
            return;
        }
        for idx in self.have_queue.drain(..) {
            for slot in self.peers.values() {
                slot.handle.peer_tx.send(PeerCommand::PieceWritten(idx)).ok();
            }
        }
    }

    async fn run_choker(&mut self) {
        let seeding = self.ctx.picker.is_seed().await;
        let rotation_window = self.ctx.config.unchoke_interval * 3;

        let candidates: Vec<ChokeCandidate> = self
            .peers
            .iter()
            .filter(|(_, slot)| slot.handle.state.conn_state == ConnState::Connected)
            .map(|(address, slot)| {
                let state = &slot.handle.state;
                ChokeCandidate {
                    address: *address,
                    download_rate: state.throughput.down.avg(),
                    upload_rate: state.throughput.up.avg(),
                    peer_interested: state.peer_interested,
                    choked: state.choked,
                    last_unchoked: state.last_unchoked,
                    uploaded_since_unchoke: state.uploaded_since_unchoke,
                    num_pieces: state.num_pieces,
                    priority: slot.priority,
                    is_new: slot.connected_at.elapsed() < rotation_window,
                }
            })
            .collect();

        let settings = ChokerSettings {
            unchoke_slots: self.ctx.config.unchoke_slots,
            rate_threshold_initial: self.ctx.config.rate_choker_initial_threshold as u64,
            seed_algorithm: self.ctx.config.seed_choke_algorithm,
            seeding_piece_quota: self.ctx.config.seeding_piece_quota,
            piece_len: self.ctx.piece_len,
            total_size: self.ctx.total_len,
        };

        let Unchokes { regular, optimistic } = self.choker.run(candidates, seeding, &settings);

        let unchoked: HashSet<SocketAddr> = regular
            .into_iter()
            .chain(optimistic)
            .collect();

        for (address, slot) in self.peers.iter() {
            let cmd = if unchoked.contains(address) {
                PeerCommand::Unchoke
            } else {
                PeerCommand::Choke
            };
            slot.handle.peer_tx.send(cmd).ok();
        }
    }

    async fn stats(&self) -> TorrentStats {
        let picker = self.ctx.picker.read().await;
        let num_pieces = picker.num_pieces();
        let num_downloaded = picker.num_have();
        let num_pending = picker.num_downloading();
        drop(picker);

        TorrentStats {
            start_time: self.start_time,
            time_elapsed: self
                .start_time
                .map(|t| t.elapsed())
                .unwrap_or_default(),
            piece_stats: PieceStats {
                num_pieces,
                num_pending,
                num_downloaded,
            },
            peer_stats: self
                .peers
                .iter()
                .map(|(address, slot)| crate::stats::PeerStats {
                    address: *address,
                    throughput: slot.handle.state.throughput,
                    num_pieces: slot.handle.state.num_pieces,
                })
                .collect(),
            throughput: Default::default(),
        }
    }

    fn disconnect_all(&mut self) {
        for slot in self.peers.values() {
            slot.handle.peer_tx.send(PeerCommand::Shutdown).ok();
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("disconnecting from {} peers", self.peers.len());
        self.disconnect_all();
        for (_, mut slot) in self.peers.drain() {
            if let Some(handle) = slot.handle.session_handle.take() {
                handle.await.ok();
            }
        }
        self.announce(Some(Event::Stopped)).await;
    }
}

// Cheap controls handed to the embedding application.
pub struct TorrentHandle {

    pub info_hash: ID,

    pub(crate) torrent_tx: TorrentTx,

    pub(crate) handle: Option<tokio::task::JoinHandle<Result<()>>>,

}

impl TorrentHandle {

    pub fn start_torrent(params: TorrentParams) -> Self {
        let (mut torrent, torrent_tx) = Torrent::new(params);
        let info_hash = torrent.ctx.info_hash;
        let handle = tokio::spawn(async move { torrent.run().await });
        Self {
            info_hash,
            torrent_tx,
            handle: Some(handle),
        }
    }

    pub fn pause(&self) {
        self.torrent_tx.send(TorrentCommand::Pause).ok();
    }

    pub fn resume(&self) {
        self.torrent_tx.send(TorrentCommand::Resume).ok();
    }

    pub fn announce_now(&self) {
        self.torrent_tx.send(TorrentCommand::AnnounceNow).ok();
    }

    // Hand-feed peer endpoints, as a resume-data loader would.
    pub fn add_peers(&self, peers: Vec<SocketAddr>) {
        self.torrent_tx.send(TorrentCommand::Peers(peers)).ok();
    }

    pub fn set_priority(&self, piece: usize, priority: u8) {
        self.torrent_tx.send(TorrentCommand::SetPriority { piece, priority }).ok();
    }

    pub async fn read_piece(&self, idx: usize) -> Option<StorageResult<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        self.torrent_tx.send(TorrentCommand::ReadPiece { idx, tx }).ok()?;
        rx.await.ok()
    }
}
