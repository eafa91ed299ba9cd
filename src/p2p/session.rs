use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::Framed;
use crate::{
    bandwidth::Direction,
    block::{BlockData, BlockInfo},
    picker::{PickOptions, PieceSpeed},
    torrent::{TorrentCommand, TorrentContext},
    Bitfield,
};
use super::{handshake::*, message::*, state::*, *};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Outbound connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Send a keep-alive after this much send-side silence.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(90);

// Hard cap on the request pipeline.
const MAX_REQUEST_QUEUE: usize = 500;

#[derive(Debug)]
pub struct PeerSession {

    // The peer's IP address.
    address: SocketAddr,

    // Context is a read only state accessible by all peers.
    torrent_ctx: Arc<TorrentContext>,

    // Commands to the peer.
    peer_rx: PeerRx,

    // Pending block requests from peer to the client, served in order.
    requests_in: VecDeque<BlockInfo>,

    // Pending block requests from client to peer, with send time for
    // timeout tracking.
    requests_out: HashMap<BlockInfo, Instant>,

    // Bitfield of pieces the peer currently has.
    bitfield: Bitfield,

    state: SessionState,

    // The peer's extension handshake, once received.
    peer_extensions: Option<ExtensionHandshake>,

    // Quota granted by the torrent limiter, per direction. None when
    // the channel is not rate limited.
    send_quota: Option<usize>,

    recv_quota: Option<usize>,

    // An ask for more quota is in flight, per direction.
    bandwidth_requested: (bool, bool),

    last_recv: Instant,

    last_send: Instant,

}

impl PeerSession {

    pub fn new(address: SocketAddr, torrent_ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, torrent_ctx.num_pieces);
        let send_quota = if torrent_ctx.rate_limited_up { Some(0) } else { None };
        let recv_quota = if torrent_ctx.rate_limited_down { Some(0) } else { None };

        (
            PeerSession {
                address,
                torrent_ctx,
                peer_rx,
                requests_in: VecDeque::new(),
                requests_out: HashMap::new(),
                bitfield,
                state: SessionState::default(),
                peer_extensions: None,
                send_quota,
                recv_quota,
                bandwidth_requested: (false, false),
                last_recv: Instant::now(),
                last_send: Instant::now(),
            },
            peer_tx,
        )
    }

    // Inbound connections arrive with their handshake already read by
    // the session listener, which routed on the infohash.
    pub async fn start_session(&mut self, inbound_conn: Option<(TcpStream, Handshake)>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        let (socket, peer_handshake) = match inbound_conn {
            Some((stream, peer_handshake)) => {
                self.state.update(|state| state.conn_state = ConnState::Handshaking);
                self.validate_handshake(&peer_handshake)?;
                let mut socket = Framed::new(stream, HandshakeCodec);
                // Respond with our half.
                socket.send(self.own_handshake()).await?;
                (socket, peer_handshake)
            }
            None => {
                let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address))
                    .await
                    .map_err(|_| PeerError::Timeout)??;
                tracing::trace!("outbound connection successful");
                let mut socket = Framed::new(stream, HandshakeCodec);
                let peer_handshake = self.exchange_handshake(&mut socket).await?;
                (socket, peer_handshake)
            }
        };
        tracing::debug!("handshake successful, peer connected");

        // From here the wire switches to length-prefixed messages. Bytes
        // past the handshake may already sit in the read buffer; they
        // must survive the codec swap.
        let codec = MessageCodec { max_frame_len: self.torrent_ctx.config.max_frame_len };
        let parts = socket.into_parts();
        let mut new_parts = tokio_util::codec::FramedParts::new(parts.io, codec);
        new_parts.read_buf = parts.read_buf;
        new_parts.write_buf = parts.write_buf;
        let socket = Framed::from_parts(new_parts);
        self.run(socket, peer_handshake).await
    }

    pub async fn disconnect(&mut self) {
        // Release every block we had on request so other peers can pick
        // them up, and drop this peer's share of piece availability.
        {
            let mut picker = self.torrent_ctx.picker.write().await;
            for (block, _) in self.requests_out.drain() {
                picker.abort_download(&block, Some(self.address));
            }
            if self.bitfield.any() {
                picker.peer_left(&self.bitfield);
            }
        }
        self.state.update(|state| state.conn_state = ConnState::Disconnected);
        self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerState {
            address: self.address,
            state: self.state,
        }).ok();
    }

    fn own_handshake(&self) -> Handshake {
        Handshake::new(
            self.torrent_ctx.info_hash,
            self.torrent_ctx.client_id,
            self.torrent_ctx.config.enable_dht,
        )
    }

    fn validate_handshake(&self, peer_handshake: &Handshake) -> Result<()> {
        if peer_handshake.protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }
        if peer_handshake.info_hash != self.torrent_ctx.info_hash {
            return Err(PeerError::IncorrectInfoHash);
        }
        if peer_handshake.peer_id == self.torrent_ctx.client_id {
            return Err(PeerError::ConnectedToSelf);
        }
        Ok(())
    }

    async fn exchange_handshake(
        &mut self,
        socket: &mut Framed<TcpStream, HandshakeCodec>,
    ) -> Result<Handshake> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        tracing::trace!("send handshake");
        socket.send(self.own_handshake()).await?;

        let deadline = self.torrent_ctx.config.handshake_timeout;
        let peer_handshake = match time::timeout(deadline, socket.next()).await {
            Err(_) => return Err(PeerError::Timeout),
            Ok(Some(Ok(handshake))) => handshake,
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Err(PeerError::NoHandshake),
        };
        self.validate_handshake(&peer_handshake)?;
        Ok(peer_handshake)
    }

    async fn run(
        &mut self,
        socket: Framed<TcpStream, MessageCodec>,
        peer_handshake: Handshake,
    ) -> Result<()> {

        self.state.connect_time = Some(Instant::now());
        self.state.update(|state| state.conn_state = ConnState::Introducing);
        let (mut sink, mut stream) = socket.split();
        let mut ticker = time::interval(Duration::from_secs(1));
        self.last_recv = Instant::now();
        self.last_send = Instant::now();

        // The torrent dedupes peer ids and may shut us down in response.
        self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerConnected {
            address: self.address,
            id: peer_handshake.peer_id,
        })?;

        if peer_handshake.supports_extensions() {
            self.send_extension_handshake(&mut sink).await?;
        }
        if peer_handshake.supports_dht() && self.torrent_ctx.config.enable_dht {
            self.send_message(&mut sink, Message::Port {
                port: self.torrent_ctx.listen_port,
            }).await?;
        }

        // Announce what we have.
        let own = self.torrent_ctx.picker.own_bitfield().await;
        if own.any() {
            self.send_message(&mut sink, Message::Bitfield(own)).await?;
        }

        loop { tokio::select! {

            // Message from peer.
            msg = stream.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        self.last_recv = Instant::now();
                        self.handle_msg(&mut sink, msg).await?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(PeerError::Timeout),
                }
            }

            // Command from elsewhere in application.
            Some(cmd) = self.peer_rx.recv() => {
                match cmd {

                    PeerCommand::PieceWritten(idx) => self.handle_written_piece(&mut sink, idx).await?,

                    PeerCommand::BlockArrived(block) => {
                        // End-game: someone else delivered it first.
                        if self.requests_out.remove(&block).is_some() {
                            self.send_message(&mut sink, Message::Cancel(block)).await?;
                        }
                    }

                    PeerCommand::Choke => self.choke_peer(&mut sink).await?,

                    PeerCommand::Unchoke => self.unchoke_peer(&mut sink).await?,

                    PeerCommand::Parole(on_parole) => {
                        self.state.update(|state| state.on_parole = on_parole);
                    }

                    PeerCommand::Bandwidth(direction, amount) => {
                        match direction {
                            Direction::Up => {
                                if let Some(quota) = self.send_quota.as_mut() {
                                    *quota += amount;
                                }
                                self.bandwidth_requested.0 = false;
                                self.serve_requests(&mut sink).await?;
                            }
                            Direction::Down => {
                                if let Some(quota) = self.recv_quota.as_mut() {
                                    *quota += amount;
                                }
                                self.bandwidth_requested.1 = false;
                                self.make_requests(&mut sink).await?;
                            }
                        }
                    }

                    PeerCommand::Shutdown => {
                        tracing::debug!("session shutdown");
                        break;
                    }

                }
            }

            t = ticker.tick() => self.tick(&mut sink, t.into_std()).await?,

        }}

        Ok(())
    }

    // Logs a message and sends to peer.
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        self.last_send = Instant::now();
        sink.send(msg).await
    }

    async fn send_extension_handshake(&mut self, sink: &mut MessageSink) -> Result<()> {
        let handshake = ExtensionHandshake {
            m: Default::default(),
            v: Some(concat!("swarm ", env!("CARGO_PKG_VERSION")).to_string()),
            p: Some(self.torrent_ctx.listen_port),
            reqq: Some(self.torrent_ctx.config.max_allowed_in_request_queue as u32),
        };
        let payload = handshake.to_bytes()?;
        self.send_message(sink, Message::Extended {
            ext_id: EXTENSION_HANDSHAKE_ID,
            payload,
        }).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);

        // The bitfield window stays open across keep-alives and the
        // extension handshake; any other message closes it.
        let closes_intro = !matches!(msg, Message::KeepAlive | Message::Extended { .. });

        match msg {

            // Bitfield can only be sent directly after handshake.
            Message::Bitfield(bitfield) => {
                if self.state.conn_state == ConnState::Introducing {
                    self.handle_bitfield(sink, bitfield).await?;
                } else {
                    tracing::warn!("unexpected bitfield");
                    return Err(PeerError::UnexpectedBitfield);
                }
            },

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = true);
                    // Free pending requests for other peers.
                    self.free_requests_out().await;
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = false);
                    // Start to make requests if interested.
                    if self.state.interested {
                        self.make_requests(sink).await?;
                    }
                }
            },

            Message::Interested => {
                // The choker decides when this peer gets its slot.
                self.state.update(|state| state.peer_interested = true);
            },

            Message::NotInterested => {
                self.state.update(|state| state.peer_interested = false);
            },

            Message::Block(block) => {
                self.handle_block(block).await?;
                self.make_requests(sink).await?;
            },

            Message::Request(request) => self.handle_request(sink, request).await?,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Port { port } => {
                // DHT port advertisement: feed the node to the table.
                let node = SocketAddr::new(self.address.ip(), port);
                self.torrent_ctx.torrent_tx.send(TorrentCommand::DhtNode(node))?;
            },

            Message::Cancel(block_info) => self.handle_cancel(block_info)?,

            Message::Extended { ext_id, payload } => self.handle_extended(ext_id, &payload)?,

        }

        if closes_intro && self.state.conn_state == ConnState::Introducing {
            self.state.update(|state| state.conn_state = ConnState::Connected);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        tracing::debug!("peer has {}/{} pieces", bitfield.count_ones(), self.torrent_ctx.num_pieces);
        // Remove trailing bits.
        if bitfield.len() < self.torrent_ctx.num_pieces {
            return Err(PeerError::InvalidMessage);
        }
        bitfield.resize(self.torrent_ctx.num_pieces, false);
        // Interested if peer has pieces we don't.
        let interested = self.torrent_ctx.picker.write().await.peer_joined(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        let idx = idx as usize;
        if idx >= self.torrent_ctx.num_pieces {
            tracing::warn!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        // Peer already has piece.
        if self.bitfield[idx] {
            return Ok(());
        }
        self.bitfield.set(idx, true);
        self.state.update(|state| state.num_pieces += 1);

        let interested = {
            let mut picker = self.torrent_ctx.picker.write().await;
            picker.inc_refcount(idx);
            self.state.interested || picker.needed_pieces(&self.bitfield)
        };

        self.update_interest(sink, interested).await
    }

    async fn handle_block(&mut self, block: BlockData) -> Result<()> {

        let info = BlockInfo::from_block(&block);
        let Some(sent_at) = self.requests_out.remove(&info) else {
            tracing::trace!("unrequested block: {:?}", &info);
            return Ok(());
        };
        self.state.record_rtt(sent_at.elapsed());

        let expected = self
            .torrent_ctx
            .picker
            .write()
            .await
            .mark_writing(&info, self.address);
        if !expected {
            // End-game duplicate, another peer beat us to it.
            tracing::trace!("duplicate block: {:?}", &info);
            return Ok(());
        }

        self.state.update(|state| state.throughput.down += block.data.len() as u64);
        if let Some(quota) = self.recv_quota.as_mut() {
            *quota = quota.saturating_sub(block.data.len());
        }
        self.torrent_ctx.torrent_tx.send(TorrentCommand::BlockArrived {
            address: self.address,
            block: info,
        })?;

        // Hand the payload to storage, then confirm the write.
        if let Err(e) = self
            .torrent_ctx
            .storage
            .write_block(block.piece_idx, block.offset, block.data)
            .await
        {
            tracing::error!("block write failed: {}", e);
            self.torrent_ctx.torrent_tx.send(TorrentCommand::FileError {
                msg: e.to_string(),
            })?;
            return Ok(());
        }

        let piece_done = self
            .torrent_ctx
            .picker
            .write()
            .await
            .mark_finished(&info);
        if piece_done {
            self.torrent_ctx.torrent_tx.send(TorrentCommand::PieceComplete {
                idx: info.piece_idx,
            })?;
        }

        Ok(())
    }

    async fn handle_request(&mut self, sink: &mut MessageSink, request: BlockInfo) -> Result<()> {

        if self.state.choked {
            // Late requests can race our choke frame; drop them.
            tracing::trace!("request whilst choked: {:?}", request);
            return Ok(());
        }
        let piece_len = self.torrent_ctx.piece_len(request.piece_idx);
        if !request.is_valid(piece_len, self.torrent_ctx.num_pieces) {
            tracing::warn!("invalid request: {:?}", request);
            return Err(PeerError::InvalidMessage);
        }
        if self.requests_in.len() >= self.torrent_ctx.config.max_allowed_in_request_queue {
            return Err(PeerError::RequestQueueFlooded);
        }
        if self.requests_in.contains(&request) {
            tracing::trace!("duplicate request: {:?}", request);
            return Ok(());
        }

        self.requests_in.push_back(request);
        self.serve_requests(sink).await
    }

    fn handle_cancel(&mut self, block_info: BlockInfo) -> Result<()> {
        if let Some(pos) = self.requests_in.iter().position(|r| *r == block_info) {
            self.requests_in.remove(pos);
        }
        Ok(())
    }

    fn handle_extended(&mut self, ext_id: u8, payload: &[u8]) -> Result<()> {
        match ext_id {
            EXTENSION_HANDSHAKE_ID => {
                let handshake = ExtensionHandshake::from_bytes(payload)?;
                tracing::debug!("peer extensions: {:?}", handshake.m.keys());
                self.peer_extensions = Some(handshake);
            }
            // Sub-ids we didn't advertise are tolerated and ignored.
            other => tracing::trace!("unhandled extension message: {}", other),
        }
        Ok(())
    }

    // When a piece is written to disk:
    // - Send a have message if the peer doesn't have it.
    // - Cancel any requests for the piece.
    // - Drop interest if the peer has nothing left we want.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        if !self.bitfield[idx] {
            self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        } else {
            let stale: Vec<BlockInfo> = self
                .requests_out
                .keys()
                .filter(|b| b.piece_idx == idx)
                .copied()
                .collect();
            for block in stale {
                self.requests_out.remove(&block);
                self.send_message(sink, Message::Cancel(block)).await?;
            }
        }

        if self.state.interested {
            let needed = self.torrent_ctx.picker.read().await.needed_pieces(&self.bitfield);
            if !needed {
                self.state.update(|state| state.interested = false);
                self.send_message(sink, Message::NotInterested).await?;
            }
        }

        Ok(())
    }

    async fn choke_peer(&mut self, sink: &mut MessageSink) -> Result<()> {
        if !self.state.choked {
            self.state.update(|state| state.choked = true);
            // Outstanding serve requests are dropped with the slot.
            self.requests_in.clear();
            self.send_message(sink, Message::Choke).await?;
        }
        Ok(())
    }

    async fn unchoke_peer(&mut self, sink: &mut MessageSink) -> Result<()> {
        if self.state.choked {
            self.state.update(|state| {
                state.choked = false;
                state.last_unchoked = Some(Instant::now());
                state.uploaded_since_unchoke = 0;
            });
            self.send_message(sink, Message::Unchoke).await?;
        }
        Ok(())
    }

    // Pipeline depth follows the bandwidth-delay product of the link,
    // bounded by whatever queue the peer said it will hold.
    fn target_queue_len(&self) -> usize {
        if self.state.snubbed {
            return 1;
        }
        let cap = self
            .peer_extensions
            .as_ref()
            .and_then(|ext| ext.reqq)
            .map(|reqq| reqq as usize)
            .unwrap_or(MAX_REQUEST_QUEUE)
            .min(MAX_REQUEST_QUEUE);
        let rate = self.state.throughput.down.avg() as u128;
        let depth = rate * self.state.rtt.as_millis() / 1000 / crate::BLOCK_SIZE as u128;
        (depth as usize).clamp(1, cap.max(1))
    }

    fn speed_class(&self) -> PieceSpeed {
        match self.state.throughput.down.avg() {
            r if r < 10 * 1024 => PieceSpeed::Slow,
            r if r < 100 * 1024 => PieceSpeed::Medium,
            _ => PieceSpeed::Fast,
        }
    }

    // Queue requests up to the target queue length.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.peer_choking || !self.state.interested {
            return Ok(());
        }
        // Upload-only mode after a storage failure: serve, don't fetch.
        if self.torrent_ctx.upload_only.load(std::sync::atomic::Ordering::Relaxed) {
            return Ok(());
        }

        let mut target = self.target_queue_len();
        // Download throttle: only pipeline what the granted quota covers.
        if let Some(quota) = self.recv_quota {
            let affordable = quota / crate::BLOCK_SIZE;
            if affordable < target {
                self.request_bandwidth(Direction::Down, target.saturating_sub(affordable) * crate::BLOCK_SIZE)?;
            }
            target = target.min(affordable);
        }
        if self.requests_out.len() >= target {
            return Ok(());
        }

        let outstanding: HashSet<BlockInfo> = self.requests_out.keys().copied().collect();
        let opts = PickOptions {
            num_blocks: target - self.requests_out.len(),
            speed: self.speed_class(),
            on_parole: self.state.on_parole,
            ..Default::default()
        };
        let requests = self
            .torrent_ctx
            .picker
            .pick_blocks(&outstanding, &self.bitfield, self.address, &opts)
            .await;

        for block in requests {
            tracing::trace!("send request: {:?}", block);
            self.requests_out.insert(block, Instant::now());
            self.send_message(sink, Message::Request(block)).await?;
        }

        Ok(())
    }

    // Serve queued requests while upload quota lasts.
    async fn serve_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        while let Some(&request) = self.requests_in.front() {

            if let Some(quota) = self.send_quota {
                if quota < request.len {
                    let wanted: usize = self.requests_in.iter().map(|r| r.len).sum();
                    self.request_bandwidth(Direction::Up, wanted)?;
                    break;
                }
            }

            self.requests_in.pop_front();
            let data = match self
                .torrent_ctx
                .storage
                .read_block(request.piece_idx, request.offset, request.len)
                .await
            {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!("block read failed: {}", e);
                    self.torrent_ctx.torrent_tx.send(TorrentCommand::FileError {
                        msg: e.to_string(),
                    })?;
                    continue;
                }
            };

            if let Some(quota) = self.send_quota.as_mut() {
                *quota -= request.len;
            }
            self.state.update(|state| {
                state.throughput.up += request.len as u64;
                state.uploaded_since_unchoke += request.len as u64;
            });
            self.send_message(sink, Message::Block(BlockData {
                piece_idx: request.piece_idx,
                offset: request.offset,
                data,
            })).await?;
        }

        Ok(())
    }

    // Free all requested blocks, making them available for other peers.
    async fn free_requests_out(&mut self) {
        let mut picker = self.torrent_ctx.picker.write().await;
        for (block, _) in self.requests_out.drain() {
            picker.abort_download(&block, Some(self.address));
        }
    }

    // If our interest changed, tell the peer.
    async fn update_interest(&mut self, sink: &mut MessageSink, interested: bool) -> Result<()> {
        if !self.state.interested && interested {
            self.state.update(|state| state.interested = true);
            self.send_message(sink, Message::Interested).await?;
            // An unchoked pipeline can fill straight away.
            self.make_requests(sink).await?;
        } else if self.state.interested && !interested {
            self.state.update(|state| state.interested = false);
            self.send_message(sink, Message::NotInterested).await?;
        }
        Ok(())
    }

    fn request_bandwidth(&mut self, direction: Direction, bytes: usize) -> Result<()> {
        let in_flight = match direction {
            Direction::Up => &mut self.bandwidth_requested.0,
            Direction::Down => &mut self.bandwidth_requested.1,
        };
        if *in_flight || bytes == 0 {
            return Ok(());
        }
        *in_flight = true;
        self.torrent_ctx.torrent_tx.send(TorrentCommand::RequestBandwidth {
            address: self.address,
            direction,
            bytes,
        })?;
        Ok(())
    }

    // Requests unanswered past the deadline go back to the picker; the
    // peer is snubbed after enough misses in a row.
    async fn expire_requests(&mut self, sink: &mut MessageSink, now: Instant) -> Result<()> {

        let timeout = self
            .torrent_ctx
            .config
            .min_request_timeout
            .max(3 * self.state.rtt);

        let expired: Vec<BlockInfo> = self
            .requests_out
            .iter()
            .filter(|(_, sent_at)| now.saturating_duration_since(**sent_at) >= timeout)
            .map(|(block, _)| *block)
            .collect();

        if expired.is_empty() {
            return Ok(());
        }

        tracing::debug!("{} requests timed out", expired.len());
        {
            let mut picker = self.torrent_ctx.picker.write().await;
            for block in &expired {
                self.requests_out.remove(block);
                picker.abort_download(block, Some(self.address));
            }
        }
        self.state.update(|state| {
            state.record_request_timeout(self.torrent_ctx.config.snub_threshold);
        });

        // A snubbed peer drops to a single request at a time.
        self.make_requests(sink).await
    }

    async fn tick(&mut self, sink: &mut MessageSink, time: Instant) -> Result<()> {

        if time.saturating_duration_since(self.last_recv) >= self.torrent_ctx.config.receive_timeout {
            tracing::debug!("receive timeout");
            return Err(PeerError::Timeout);
        }

        if !self.state.interested
        && !self.state.peer_interested
        && time.saturating_duration_since(self.state.connect_time.unwrap())
            >= Duration::from_secs(30)
        {
            tracing::debug!("disconnecting peer due to inactivity");
            return Err(PeerError::Timeout);
        }

        self.expire_requests(sink, time).await?;

        if time.saturating_duration_since(self.last_send) >= KEEP_ALIVE_INTERVAL {
            self.send_message(sink, Message::KeepAlive).await?;
        }

        // Send stats if there is a state change.
        if self.state.changed {
            self.state.changed = false;
            self.torrent_ctx.torrent_tx.send(TorrentCommand::PeerState {
                address: self.address,
                state: self.state,
            })?;
        }
        self.state.tick();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::tests::test_context;

    #[test]
    fn test_target_queue_len_tracks_rate() {
        let ctx = test_context(16);
        let (mut session, _tx) = PeerSession::new("10.0.0.1:6881".parse().unwrap(), ctx);

        // Idle link pipelines a single request.
        assert_eq!(session.target_queue_len(), 1);

        // 1 MiB/s at 2 s rtt wants a deep pipeline, clamped to the cap.
        for _ in 0..20 {
            session.state.throughput.down += 1024 * 1024;
            session.state.tick();
        }
        assert!(session.target_queue_len() > 50);
        assert!(session.target_queue_len() <= MAX_REQUEST_QUEUE);

        // Snubbed peers are limited to one request regardless of rate.
        session.state.snubbed = true;
        assert_eq!(session.target_queue_len(), 1);
    }

    #[test]
    fn test_speed_class_thresholds() {
        let ctx = test_context(16);
        let (mut session, _tx) = PeerSession::new("10.0.0.1:6881".parse().unwrap(), ctx);
        assert_eq!(session.speed_class(), PieceSpeed::Slow);
        for _ in 0..20 {
            session.state.throughput.down += 50 * 1024;
            session.state.tick();
        }
        assert_eq!(session.speed_class(), PieceSpeed::Medium);
        for _ in 0..20 {
            session.state.throughput.down += 500 * 1024;
            session.state.tick();
        }
        assert_eq!(session.speed_class(), PieceSpeed::Fast);
    }
}
