use std::net::IpAddr;
use crate::ID;

// Collaborator seams. The engine core stays off the disk and out of the
// metainfo: it sees pieces through these traits only. Implementations
// live with the embedding application.

#[derive(Debug, thiserror::Error)]
pub enum StorageError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("disk full")]
    DiskFull,

    #[error("piece {0} out of range")]
    InvalidPiece(usize),

}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait::async_trait]
pub trait Storage: Send + Sync + 'static {

    async fn read_block(&self, piece_idx: usize, offset: usize, len: usize) -> StorageResult<Vec<u8>>;

    async fn write_block(&self, piece_idx: usize, offset: usize, data: Vec<u8>) -> StorageResult<()>;

    // Hash the assembled piece and compare against the expected hash.
    // The hashing pipeline (and its thread pool) belongs to the
    // implementation, not the engine.
    async fn hash_piece(&self, piece_idx: usize) -> StorageResult<ID>;

}

// The already-parsed torrent descriptor. Immutable for the life of
// the torrent.
pub trait MetainfoOps: Send + Sync + 'static {

    fn info_hash(&self) -> ID;

    fn num_pieces(&self) -> usize;

    fn piece_length(&self, piece_idx: usize) -> usize;

    fn piece_hash(&self, piece_idx: usize) -> ID;

    fn total_size(&self) -> u64;

    // Announce urls grouped in tiers, in metainfo order.
    fn trackers(&self) -> Vec<Vec<url::Url>>;

}

pub trait PortMapper: Send + Sync + 'static {

    fn map(&self, port: u16, proto: PortProto) -> Option<u16>;

    fn unmap(&self, port: u16, proto: PortProto);

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortProto {
    Tcp,
    Udp,
}

#[async_trait::async_trait]
pub trait Resolver: Send + Sync + 'static {

    async fn resolve(&self, name: &str, want_v6: bool) -> std::io::Result<Vec<IpAddr>>;

}
