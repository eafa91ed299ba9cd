use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time};
use url::Url;
use crate::{storage::Resolver, ID};
use super::{
    AnnounceParams, AnnounceResponse, Event, Result, ScrapeEntry, Tracker, TrackerError,
    DEFAULT_ANNOUNCE_INTERVAL, DEFAULT_MIN_ANNOUNCE_INTERVAL,
};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: i64 = 0x41727101980;
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;
const ACTION_SCRAPE: i32 = 2;
const ACTION_ERROR: i32 = 3;

// Connection ids are valid for a minute after the connect round.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

// Retransmit timeout is 15 * 2^n seconds.
const RETRY_BASE_SECS: u64 = 15;
const CONNECT_ATTEMPTS: u32 = 4;
const ANNOUNCE_ATTEMPTS: u32 = 15;

pub struct UdpTracker {

    url: Url,

    // Host resolution collaborator; system DNS when absent.
    resolver: Option<Arc<dyn Resolver>>,

    // Connection id with the time it was obtained.
    conn_id: Option<(i64, Instant)>,

    last_announce: Option<Instant>,

    interval: Option<Duration>,

    // Test hook: caps the per-attempt timeout so retry tests don't
    // sleep for real.
    max_retry_timeout: Option<Duration>,

}

impl UdpTracker {

    pub fn new(url: Url, resolver: Option<Arc<dyn Resolver>>) -> Self {
        Self {
            url,
            resolver,
            conn_id: None,
            last_announce: None,
            interval: None,
            max_retry_timeout: None,
        }
    }

    fn retry_timeout(&self, attempt: u32) -> Duration {
        let timeout = Duration::from_secs(RETRY_BASE_SECS * 2u64.pow(attempt));
        match self.max_retry_timeout {
            Some(cap) => timeout.min(cap),
            None => timeout,
        }
    }

    async fn open_socket(&self) -> Result<UdpSocket> {
        let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
        let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;

        // Resolve through the collaborator when one is installed,
        // preferring the family of our listener; warn and take what we
        // can get otherwise.
        let addrs: Vec<SocketAddr> = match &self.resolver {
            Some(resolver) => resolver
                .resolve(host, false)
                .await?
                .into_iter()
                .map(|ip| SocketAddr::new(ip, port))
                .collect(),
            None => tokio::net::lookup_host((host, port)).await?.collect(),
        };
        let addr = match addrs.iter().find(|a| a.is_ipv4()) {
            Some(addr) => *addr,
            None => {
                let addr = addrs.first().copied().ok_or(TrackerError::InvalidUrl)?;
                tracing::warn!("tracker {} resolved only to ipv6", self.url);
                addr
            }
        };

        let bind: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind).await?;
        // Connecting filters out datagrams from any other source.
        socket.connect(addr).await?;
        Ok(socket)
    }

    // Round 1: obtain a connection id, retrying with exponential backoff.
    async fn connect(&mut self, socket: &UdpSocket) -> Result<i64> {

        if let Some((id, at)) = self.conn_id {
            if at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
        }

        for attempt in 0..CONNECT_ATTEMPTS {
            let trans_id: i32 = rand::random();

            let mut buf = BytesMut::with_capacity(16);
            buf.put_i64(PROTOCOL_ID);
            buf.put_i32(ACTION_CONNECT);
            buf.put_i32(trans_id);
            debug_assert_eq!(buf.len(), 16);
            socket.send(&buf).await?;

            match self.recv_action(socket, ACTION_CONNECT, trans_id, attempt, 8).await {
                Ok(mut resp) => {
                    let conn_id = resp.get_i64();
                    self.conn_id = Some((conn_id, Instant::now()));
                    tracing::trace!("connected to tracker, conn id {:x}", conn_id);
                    return Ok(conn_id);
                }
                Err(TrackerError::Timeout(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(TrackerError::ResponseError("connect retries exhausted".into()))
    }

    // Wait for a reply with the right action and transaction id. Stray
    // datagrams are discarded, not fatal.
    async fn recv_action(
        &self,
        socket: &UdpSocket,
        action: i32,
        trans_id: i32,
        attempt: u32,
        min_payload: usize,
    ) -> Result<BytesMut> {

        let deadline = Instant::now() + self.retry_timeout(attempt);
        loop {
            // A zero remaining budget makes the timeout fire immediately.
            let remaining = deadline.saturating_duration_since(Instant::now());

            let mut resp_buf = [0u8; 4096];
            let n = time::timeout(remaining, socket.recv(&mut resp_buf)).await??;
            if n < 8 {
                tracing::trace!("runt datagram ({} bytes) ignored", n);
                continue;
            }

            let mut resp = &resp_buf[..n];
            let resp_action = resp.get_i32();
            let resp_trans_id = resp.get_i32();
            if resp_trans_id != trans_id {
                tracing::trace!("datagram with wrong transaction id ignored");
                continue;
            }
            if resp_action == ACTION_ERROR {
                let msg = String::from_utf8_lossy(resp).to_string();
                return Err(TrackerError::Failure(msg));
            }
            if resp_action != action {
                tracing::trace!("datagram with wrong action ignored");
                continue;
            }
            if n < 8 + min_payload {
                return Err(TrackerError::ResponseError("short reply".into()));
            }

            let mut out = BytesMut::with_capacity(n - 8);
            out.extend_from_slice(resp);
            return Ok(out);
        }
    }

    pub async fn scrape(&mut self, info_hashes: &[ID]) -> Result<Vec<ScrapeEntry>> {

        let socket = self.open_socket().await?;
        let conn_id = self.connect(&socket).await?;
        let trans_id: i32 = rand::random();

        let mut buf = BytesMut::with_capacity(16 + 20 * info_hashes.len());
        buf.put_i64(conn_id);
        buf.put_i32(ACTION_SCRAPE);
        buf.put_i32(trans_id);
        for hash in info_hashes {
            buf.put(&hash[..]);
        }
        socket.send(&buf).await?;

        let mut resp = self
            .recv_action(&socket, ACTION_SCRAPE, trans_id, 0, 12 * info_hashes.len())
            .await?;

        let mut entries = Vec::with_capacity(info_hashes.len());
        for _ in 0..info_hashes.len() {
            entries.push(ScrapeEntry {
                complete: resp.get_u32(),
                downloaded: resp.get_u32(),
                incomplete: resp.get_u32(),
            });
        }
        Ok(entries)
    }
}

#[async_trait::async_trait]
impl Tracker for UdpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse> {

        let socket = self.open_socket().await?;

        // Stopped events are best-effort with a short deadline.
        let attempts = if params.event == Some(Event::Stopped) {
            1
        } else {
            ANNOUNCE_ATTEMPTS
        };

        for attempt in 0..attempts {
            let conn_id = self.connect(&socket).await?;
            let trans_id: i32 = rand::random();

            let mut buf = BytesMut::with_capacity(98);
            buf.put_i64(conn_id);
            buf.put_i32(ACTION_ANNOUNCE);
            buf.put_i32(trans_id);
            buf.put(&params.info_hash[..]);
            buf.put(&params.client_id[..]);
            buf.put_u64(params.downloaded);
            buf.put_u64(params.left);
            buf.put_u64(params.uploaded);
            buf.put_i32(match params.event {
                Some(Event::Completed) => 1,
                Some(Event::Started) => 2,
                Some(Event::Stopped) => 3,
                None => 0,
            });
            buf.put_u32(0); // IP address, default = 0.
            buf.put_u32(params.key);
            buf.put_i32(match params.num_want {
                Some(num_want) => num_want as i32,
                None => -1,
            });
            buf.put_u16(params.port);
            debug_assert_eq!(buf.len(), 98);

            socket.send(&buf).await?;

            let mut resp = match self.recv_action(&socket, ACTION_ANNOUNCE, trans_id, attempt, 12).await {
                Ok(resp) => resp,
                Err(TrackerError::Timeout(_)) => {
                    // The connection id may have expired with the wait.
                    if self.conn_id.map(|(_, at)| at.elapsed() >= CONNECTION_ID_TTL).unwrap_or(true) {
                        self.conn_id = None;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let interval = resp.get_u32();
            let leechers = resp.get_u32();
            let seeders = resp.get_u32();
            let num_peers = resp.remaining() / 6;

            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                let ip = resp.get_u32();
                let port = resp.get_u16();
                peers.push(SocketAddr::new(Ipv4Addr::from(ip).into(), port));
            }

            tracing::debug!("tracker provided {} peers", peers.len());
            if attempt > 0 {
                tracing::debug!("announce succeeded after {} retries", attempt);
            }
            self.interval = Some(Duration::from_secs(interval as u64));
            self.last_announce = Some(Instant::now());
            return Ok(AnnounceResponse {
                peers,
                interval: Some(interval as u64),
                min_interval: None,
                complete: Some(seeders as u64),
                incomplete: Some(leechers as u64),
            });
        }

        Err(TrackerError::ResponseError("announce retries exhausted".into()))
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn can_announce(&self, time: Instant) -> bool {
        if let Some(last_announce) = self.last_announce {
            time.duration_since(last_announce)
                >= Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL)
        } else {
            true
        }
    }

    fn should_announce(&self, time: Instant) -> bool {
        if let Some(last_announce) = self.last_announce {
            time.duration_since(last_announce)
                >= self.interval.unwrap_or(Duration::from_secs(DEFAULT_ANNOUNCE_INTERVAL))
        } else {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN_ID: i64 = 0xDEADBEEFCAFEBABEu64 as i64;

    // Minimal BEP-15 tracker: answers one connect and one announce (or
    // scrape), validating the byte layouts as it goes.
    async fn mock_tracker(peers: u32, drop_first_announce: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut dropped = false;
            let mut buf = [0u8; 1024];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                let mut req = &buf[..n];

                if n == 16 {
                    // Connect round.
                    assert_eq!(req.get_i64(), PROTOCOL_ID);
                    assert_eq!(req.get_i32(), ACTION_CONNECT);
                    let trans_id = req.get_i32();
                    let mut resp = BytesMut::new();
                    resp.put_i32(ACTION_CONNECT);
                    resp.put_i32(trans_id);
                    resp.put_i64(CONN_ID);
                    socket.send_to(&resp, from).await.unwrap();
                } else if n == 98 {
                    // Announce round.
                    assert_eq!(req.get_i64(), CONN_ID);
                    assert_eq!(req.get_i32(), ACTION_ANNOUNCE);
                    let trans_id = req.get_i32();
                    if drop_first_announce && !dropped {
                        dropped = true;
                        continue;
                    }
                    let mut resp = BytesMut::new();
                    resp.put_i32(ACTION_ANNOUNCE);
                    resp.put_i32(trans_id);
                    resp.put_u32(1800); // interval
                    resp.put_u32(3); // leechers
                    resp.put_u32(7); // seeders
                    for i in 0..peers {
                        resp.put_u32(0x0a000001 + i);
                        resp.put_u16(6881);
                    }
                    socket.send_to(&resp, from).await.unwrap();
                } else {
                    // Scrape round: 16 byte header + 20 per hash.
                    assert_eq!(req.get_i64(), CONN_ID);
                    assert_eq!(req.get_i32(), ACTION_SCRAPE);
                    let trans_id = req.get_i32();
                    let hashes = (n - 16) / 20;
                    let mut resp = BytesMut::new();
                    resp.put_i32(ACTION_SCRAPE);
                    resp.put_i32(trans_id);
                    for _ in 0..hashes {
                        resp.put_u32(5);
                        resp.put_u32(100);
                        resp.put_u32(2);
                    }
                    socket.send_to(&resp, from).await.unwrap();
                }
            }
        });

        addr
    }

    fn tracker_for(addr: SocketAddr) -> UdpTracker {
        let url = Url::parse(&format!("udp://{}", addr)).unwrap();
        let mut tracker = UdpTracker::new(url, None);
        tracker.max_retry_timeout = Some(Duration::from_millis(200));
        tracker
    }

    #[tokio::test]
    async fn test_connect_announce_round_trip() {
        let addr = mock_tracker(3, false).await;
        let mut tracker = tracker_for(addr);

        let resp = tracker
            .announce(AnnounceParams {
                info_hash: [1; 20],
                client_id: [2; 20],
                port: 6881,
                left: 1024,
                event: Some(Event::Completed),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(resp.peers.len(), 3);
        assert_eq!(resp.peers[0], "10.0.0.1:6881".parse().unwrap());
        assert_eq!(resp.interval, Some(1800));
        assert_eq!(resp.complete, Some(7));
        assert_eq!(resp.incomplete, Some(3));
        // The connection id is cached for reuse.
        assert_eq!(tracker.conn_id.unwrap().0, CONN_ID);
    }

    #[tokio::test]
    async fn test_announce_retries_after_dropped_packet() {
        let addr = mock_tracker(1, true).await;
        let mut tracker = tracker_for(addr);

        let resp = tracker
            .announce(AnnounceParams {
                info_hash: [1; 20],
                client_id: [2; 20],
                port: 6881,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resp.peers.len(), 1);
    }

    // Maps any name to fixed addresses, standing in for the embedding
    // application's DNS.
    struct StaticResolver {
        addrs: Vec<std::net::IpAddr>,
    }

    #[async_trait::async_trait]
    impl Resolver for StaticResolver {
        async fn resolve(&self, _name: &str, _want_v6: bool) -> std::io::Result<Vec<std::net::IpAddr>> {
            Ok(self.addrs.clone())
        }
    }

    #[tokio::test]
    async fn test_announce_resolves_through_collaborator() {
        let addr = mock_tracker(2, false).await;
        let resolver = Arc::new(StaticResolver { addrs: vec![addr.ip()] });

        // The hostname only exists inside the resolver.
        let url = Url::parse(&format!("udp://tracker.internal:{}", addr.port())).unwrap();
        let mut tracker = UdpTracker::new(url, Some(resolver));
        tracker.max_retry_timeout = Some(Duration::from_millis(200));

        let resp = tracker
            .announce(AnnounceParams {
                info_hash: [1; 20],
                client_id: [2; 20],
                port: 6881,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resp.peers.len(), 2);
    }

    #[tokio::test]
    async fn test_scrape() {
        let addr = mock_tracker(0, false).await;
        let mut tracker = tracker_for(addr);

        let entries = tracker.scrape(&[[1; 20], [2; 20]]).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].complete, 5);
        assert_eq!(entries[0].downloaded, 100);
        assert_eq!(entries[0].incomplete, 2);
    }

    #[tokio::test]
    async fn test_stray_transaction_id_ignored() {
        // A tracker that first sends a bogus txid reply, then the real one.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            let mut req = &buf[..n];
            req.advance(12);
            let trans_id = req.get_i32();

            let mut bogus = BytesMut::new();
            bogus.put_i32(ACTION_CONNECT);
            bogus.put_i32(trans_id.wrapping_add(1));
            bogus.put_i64(0x1111);
            socket.send_to(&bogus, from).await.unwrap();

            let mut resp = BytesMut::new();
            resp.put_i32(ACTION_CONNECT);
            resp.put_i32(trans_id);
            resp.put_i64(CONN_ID);
            socket.send_to(&resp, from).await.unwrap();
        });

        let mut tracker = tracker_for(addr);
        let socket = tracker.open_socket().await.unwrap();
        let conn_id = tracker.connect(&socket).await.unwrap();
        assert_eq!(conn_id, CONN_ID);
    }
}
