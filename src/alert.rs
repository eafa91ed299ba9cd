use std::net::SocketAddr;
use tokio::sync::mpsc;
use crate::{stats::TorrentStats, ID};

pub type AlertTx = mpsc::UnboundedSender<Alert>;
pub type AlertRx = mpsc::UnboundedReceiver<Alert>;

// Structured events posted to the application. Delivery order is the
// order the session produced them.
#[derive(Debug)]
pub enum Alert {

    PeerConnected { info_hash: ID, address: SocketAddr },

    PeerDisconnected { info_hash: ID, address: SocketAddr },

    // A piece passed its hash check and was written out.
    PieceFinished { info_hash: ID, piece_idx: usize },

    // A completed piece failed its hash check; contributing peers were
    // penalized and the piece was returned to the picker.
    HashFailed { info_hash: ID, piece_idx: usize },

    PeerBanned { info_hash: ID, address: SocketAddr },

    TorrentFinished { info_hash: ID },

    TrackerReply { info_hash: ID, url: url::Url, num_peers: usize },

    TrackerError { info_hash: ID, url: url::Url, msg: String },

    DhtReply { info_hash: ID, num_peers: usize },

    DhtBootstrap { num_nodes: usize },

    // Storage failure. Fatal for the torrent: it switches to upload-only.
    FileError { info_hash: ID, msg: String },

    // The listen socket could not be bound; no further peers are admitted.
    ListenFailed { address: SocketAddr, msg: String },

    PerformanceWarning { info_hash: ID, issue: PerformanceIssue },

    Stats(TorrentStats),

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceIssue {

    // The request queue ran empty, download rate suffers.
    OutstandingRequestLimitReached,

    // DNS for a tracker returned only an address family we don't listen on.
    WrongAddressFamily,

    // Upload/download ratio far off, peers likely snubbing us.
    UploadStarved,

}
