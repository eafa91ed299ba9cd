use std::{collections::HashSet, net::SocketAddr};
use tokio::sync::RwLock;
use crate::{block::BlockInfo, Bitfield};

pub mod partial_piece;
pub mod piece_picker;

pub use partial_piece::{BlockState, PartialPiece, PieceSpeed};
pub use piece_picker::{PickOptions, Picked, PiecePicker, PRIORITY_FILTERED, PRIORITY_NORMAL};

// Shared handle to the picker, used concurrently by all peer sessions of
// a torrent through the torrent context.
#[derive(Debug)]
pub struct Picker {
    inner: RwLock<PiecePicker>,
}

impl Picker {

    pub fn new(num_pieces: usize, piece_len: usize, last_piece_len: usize) -> Self {
        Self {
            inner: RwLock::new(PiecePicker::new(num_pieces, piece_len, last_piece_len)),
        }
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, PiecePicker> {
        self.inner.read().await
    }

    pub async fn write(&self) -> tokio::sync::RwLockWriteGuard<'_, PiecePicker> {
        self.inner.write().await
    }

    // Stage blocks for a peer and mark them requested in one step, so
    // two sessions refilling at once can't stage the same block.
    pub async fn pick_blocks(
        &self,
        current_requests: &HashSet<BlockInfo>,
        bf: &Bitfield,
        peer: SocketAddr,
        opts: &PickOptions,
    ) -> Vec<BlockInfo> {

        let mut picker = self.inner.write().await;
        let picked = picker.pick(bf, peer, opts);

        let mut requests = Vec::with_capacity(opts.num_blocks);
        for block in picked.blocks {
            if requests.len() >= opts.num_blocks {
                break;
            }
            if current_requests.contains(&block) {
                continue;
            }
            picker.mark_requesting(&block, peer, opts.speed);
            requests.push(block);
        }

        // End-game: redundantly request busy blocks, skipping ones this
        // peer already has in flight.
        for block in picked.backup {
            if requests.len() >= opts.num_blocks {
                break;
            }
            if current_requests.contains(&block) || picker.num_peers(&block) > 1 {
                continue;
            }
            picker.mark_requesting(&block, peer, opts.speed);
            requests.push(block);
        }

        requests
    }

    pub async fn own_bitfield(&self) -> Bitfield {
        self.inner.read().await.own_bitfield().clone()
    }

    pub async fn is_seed(&self) -> bool {
        self.inner.read().await.is_seed()
    }
}
