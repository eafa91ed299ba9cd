mod alert;
mod bandwidth;
mod block;
mod choker;
mod config;
mod dht;
mod p2p;
mod picker;
mod session;
mod stats;
mod storage;
mod torrent;
mod tracker;

// The network transfer unit. Pieces are split into 16 KiB blocks,
// except possibly the last block of the last piece.
pub const BLOCK_SIZE: usize = 0x4000;

// Bit per piece, MSB-first within each byte, as on the wire.
pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20-byte identifiers: infohashes, peer ids.
pub type ID = [u8; 20];

pub use alert::{Alert, AlertRx, AlertTx, PerformanceIssue};
pub use config::{Config, SeedChokeAlgorithm, TorrentConfig};
pub use dht::NodeId;
pub use p2p::Handshake;
pub use session::{Session, SessionCommand, SessionError, SessionTx};
pub use stats::{Counter, PeerStats, PieceStats, ThroughputStats, TorrentStats};
pub use storage::{
    MetainfoOps, PortMapper, PortProto, Resolver, Storage, StorageError, StorageResult,
};
pub use torrent::TorrentHandle;
