use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use crate::ID;

// Fingerprint encodes client and version in the peer id prefix,
// -SW0100- style, followed by random bytes.
pub const FINGERPRINT: &[u8; 8] = b"-SW0100-";

pub fn generate_peer_id() -> ID {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(FINGERPRINT);
    rand::Rng::fill(&mut rand::thread_rng(), &mut id[8..]);
    id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedChokeAlgorithm {
    RoundRobin,
    FastestUpload,
    AntiLeech,
}

#[derive(Debug, Clone)]
pub struct Config {

    // Unique 20-byte identifier used by client, same prefix for all torrents.
    pub client_id: ID,

    // Address on which the client listens for incoming peers.
    // All torrents share the listen port.
    pub listen_address: SocketAddr,

    // Session-wide rate limits in bytes/s. None = unlimited.
    pub upload_rate_limit: Option<usize>,

    pub download_rate_limit: Option<usize>,

    // Fixed number of upload slots. None selects the rate-based policy.
    pub unchoke_slots: Option<usize>,

    // Starting threshold for the rate-based unchoker, bytes/s.
    pub rate_choker_initial_threshold: usize,

    pub unchoke_interval: Duration,

    pub seed_choke_algorithm: SeedChokeAlgorithm,

    // Pieces a round-robin unchoked peer may receive per minute before
    // it is rotated out.
    pub seeding_piece_quota: usize,

    // Serve-side request queue cap per peer.
    pub max_allowed_in_request_queue: usize,

    pub handshake_timeout: Duration,

    pub receive_timeout: Duration,

    pub min_request_timeout: Duration,

    // Request expiries before a peer is snubbed.
    pub snub_threshold: u32,

    // Frames above this payload size are a protocol error.
    pub max_frame_len: usize,

    // Trust score at which a peer is banned.
    pub ban_threshold: i16,

    pub announce_to_all_tiers: bool,

    pub announce_to_all_trackers: bool,

    pub num_want: usize,

    // DHT toggles.
    pub enable_dht: bool,

    // Bootstrap routers, queried when the routing table is empty.
    pub dht_routers: Vec<std::net::SocketAddr>,

    pub dht_enforce_node_id: bool,

    pub dht_restrict_search_ips: bool,

    pub dht_aggressive_lookups: bool,

    pub enable_stats_alerts: bool,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: generate_peer_id(),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            upload_rate_limit: None,
            download_rate_limit: None,
            unchoke_slots: None,
            rate_choker_initial_threshold: 1024,
            unchoke_interval: Duration::from_secs(10),
            seed_choke_algorithm: SeedChokeAlgorithm::RoundRobin,
            seeding_piece_quota: 20,
            max_allowed_in_request_queue: 500,
            handshake_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(120),
            min_request_timeout: Duration::from_secs(10),
            snub_threshold: 3,
            max_frame_len: 0x100000,
            ban_threshold: -5,
            announce_to_all_tiers: false,
            announce_to_all_trackers: false,
            num_want: 50,
            enable_dht: true,
            dht_routers: Vec::new(),
            dht_enforce_node_id: false,
            dht_restrict_search_ips: true,
            dht_aggressive_lookups: false,
            enable_stats_alerts: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TorrentConfig {

    // Torrent rate limits draw from the session limits.
    pub upload_rate_limit: Option<usize>,

    pub download_rate_limit: Option<usize>,

    // The minimum and maximum peers desired for the torrent.
    pub min_max_peers: (u32, u32),

    // Availability at which piece selection switches from rarest-first
    // to index order. None = always rarest-first.
    pub sequential_threshold: Option<u16>,

    pub allow_multiple_connections_per_ip: bool,

}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            upload_rate_limit: None,
            download_rate_limit: None,
            min_max_peers: (5, 100),
            sequential_threshold: None,
            allow_multiple_connections_per_ip: false,
        }
    }
}
