use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::{bandwidth::Direction, block::BlockInfo, torrent::TorrentContext};

mod handshake;
mod message;
mod session;
pub mod state;

pub use handshake::{Handshake, HandshakeCodec, PROTOCOL};
pub use message::{ExtensionHandshake, Message, MessageCodec};
pub use session::PeerSession;
use state::SessionState;

type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("connected to self")]
    ConnectedToSelf,

    #[error("no handshake received")]
    NoHandshake,

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("bitfield sent mid-stream")]
    UnexpectedBitfield,

    #[error("invalid message payload")]
    InvalidMessage,

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("request queue flooded")]
    RequestQueueFlooded,

    #[error("bencode error: {0}")]
    Bencode(String),

    #[error("connection timeout")]
    Timeout,

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands that can be sent to a peer session.
#[derive(Debug)]
pub enum PeerCommand {

    // Tell the peer we got a piece (piece idx); sends have or cancels.
    PieceWritten(usize),

    // A block arrived from another peer; cancel any duplicate request
    // for it (end-game).
    BlockArrived(BlockInfo),

    // Choker decisions.
    Choke,

    Unchoke,

    // Restrict (or release) the peer to confirming its own pieces after
    // a hash failure it contributed to.
    Parole(bool),

    // Quota granted by the torrent's rate limiter.
    Bandwidth(Direction, usize),

    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    // Sends commands to the peer session.
    pub peer_tx: PeerTx,

    // Handle to the peer session task.
    pub session_handle: Option<JoinHandle<()>>,

    // Latest state snapshot reported by the session.
    pub state: SessionState,

    // Observed peer id, known after the handshake.
    pub id: Option<[u8; 20]>,

}

impl PeerHandle {
    pub fn start_session(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        inbound_conn: Option<(TcpStream, Handshake)>,
    ) -> Self {

        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(async move {
            if let Err(e) = session.start_session(inbound_conn).await {
                tracing::info!("session error: {}", e);
            }
            session.disconnect().await;
        }.instrument(tracing::info_span!("peer", addr = %address)));

        PeerHandle {
            peer_tx,
            session_handle: Some(session_handle),
            state: SessionState::default(),
            id: None,
        }
    }
}
