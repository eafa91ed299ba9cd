use std::net::SocketAddr;
use crate::{
    block::{block_len, num_blocks, BlockInfo},
    BLOCK_SIZE,
};

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {

    // Block has not been requested.
    #[default]
    Free,

    // Requested from num_peers peers. More than one only in end-game.
    Requested { num_peers: u16 },

    // Received and handed to storage, write not yet confirmed.
    Writing,

    // Written out.
    Finished,

}

// Download rate class of the piece. Moves toward faster only, so a piece
// started by a slow peer can be adopted by faster ones but not demoted
// mid-download.
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum PieceSpeed {
    #[default]
    Slow,
    Medium,
    Fast,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BlockSlot {

    pub state: BlockState,

    // The peer the block was last requested from or received from.
    pub peer: Option<SocketAddr>,

}

// Per-block bookkeeping for a piece with at least one requested block.
// Created lazily on first pick into the piece, dropped when the piece
// completes or is restored after a hash failure.
#[derive(Debug, Clone)]
pub struct PartialPiece {

    pub idx: usize,

    pub len: usize,

    pub speed: PieceSpeed,

    blocks: Vec<BlockSlot>,

}

impl PartialPiece {

    pub fn new(idx: usize, len: usize) -> Self {
        Self {
            idx,
            len,
            speed: PieceSpeed::default(),
            blocks: vec![BlockSlot::default(); num_blocks(len) as usize],
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_info(&self, block_idx: usize) -> BlockInfo {
        BlockInfo {
            piece_idx: self.idx,
            offset: block_idx * BLOCK_SIZE,
            len: block_len(self.len, block_idx),
        }
    }

    pub fn state(&self, block_idx: usize) -> BlockState {
        self.blocks[block_idx].state
    }

    pub fn peer(&self, block_idx: usize) -> Option<SocketAddr> {
        self.blocks[block_idx].peer
    }

    pub fn num_peers(&self, block_idx: usize) -> u16 {
        match self.blocks[block_idx].state {
            BlockState::Requested { num_peers } => num_peers,
            _ => 0,
        }
    }

    // Peers that contributed data to this piece. Used to hand out the
    // penalty after a hash failure.
    pub fn contributors(&self) -> Vec<SocketAddr> {
        let mut peers: Vec<SocketAddr> = self
            .blocks
            .iter()
            .filter(|b| matches!(b.state, BlockState::Writing | BlockState::Finished))
            .filter_map(|b| b.peer)
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn update_speed(&mut self, speed: PieceSpeed) {
        if speed > self.speed {
            self.speed = speed;
        }
    }

    // Free -> Requested, or another request on an already-requested
    // block in end-game.
    pub fn request(&mut self, block_idx: usize, peer: SocketAddr) {
        let slot = &mut self.blocks[block_idx];
        match slot.state {
            BlockState::Free => {
                slot.state = BlockState::Requested { num_peers: 1 };
                slot.peer = Some(peer);
            }
            BlockState::Requested { num_peers } => {
                slot.state = BlockState::Requested { num_peers: num_peers + 1 };
            }
            // Late end-game request for a block already in flight to
            // disk, nothing to track.
            BlockState::Writing | BlockState::Finished => {}
        }
    }

    // Returns false if the block was not awaited (duplicate or spam).
    pub fn received(&mut self, block_idx: usize, peer: SocketAddr) -> bool {
        let slot = &mut self.blocks[block_idx];
        match slot.state {
            BlockState::Requested { .. } => {
                slot.state = BlockState::Writing;
                slot.peer = Some(peer);
                true
            }
            _ => false,
        }
    }

    pub fn finished(&mut self, block_idx: usize) {
        let slot = &mut self.blocks[block_idx];
        debug_assert_eq!(slot.state, BlockState::Writing);
        slot.state = BlockState::Finished;
    }

    // Drop one peer's claim on a block. The block only frees up once no
    // peer has it requested.
    pub fn abort(&mut self, block_idx: usize, peer: Option<SocketAddr>) {
        let slot = &mut self.blocks[block_idx];
        if let BlockState::Requested { num_peers } = slot.state {
            if num_peers <= 1 {
                slot.state = BlockState::Free;
                slot.peer = None;
            } else {
                slot.state = BlockState::Requested { num_peers: num_peers - 1 };
                if slot.peer == peer {
                    slot.peer = None;
                }
            }
        }
    }

    // Release every block a departing peer had requested.
    pub fn abort_peer(&mut self, peer: SocketAddr) -> Vec<usize> {
        let mut freed = Vec::new();
        for i in 0..self.blocks.len() {
            if self.blocks[i].peer == Some(peer)
                && matches!(self.blocks[i].state, BlockState::Requested { .. })
            {
                self.abort(i, Some(peer));
                freed.push(i);
            }
        }
        freed
    }

    // True if no block in this piece is claimed by anyone else.
    pub fn exclusive_to(&self, peer: SocketAddr) -> bool {
        self.blocks.iter().all(|b| b.peer.map_or(true, |p| p == peer))
    }

    pub fn all_finished(&self) -> bool {
        self.blocks.iter().all(|b| b.state == BlockState::Finished)
    }

    pub fn has_open_blocks(&self) -> bool {
        self.blocks.iter().any(|b| b.state != BlockState::Free)
    }

    pub fn finished_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.state == BlockState::Finished).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", n).parse().unwrap()
    }

    #[test]
    fn test_block_lifecycle() {
        let mut piece = PartialPiece::new(3, 3 * BLOCK_SIZE + 100);
        assert_eq!(piece.num_blocks(), 4);
        assert_eq!(piece.block_info(3).len, 100);

        piece.request(0, addr(1));
        assert_eq!(piece.state(0), BlockState::Requested { num_peers: 1 });
        assert!(piece.received(0, addr(1)));
        assert_eq!(piece.state(0), BlockState::Writing);
        piece.finished(0);
        assert_eq!(piece.state(0), BlockState::Finished);
        assert!(!piece.all_finished());
        assert_eq!(piece.finished_blocks(), 1);
    }

    #[test]
    fn test_abort_restores_prior_state() {
        let mut piece = PartialPiece::new(0, 2 * BLOCK_SIZE);
        piece.request(1, addr(1));
        piece.abort(1, Some(addr(1)));
        assert_eq!(piece.state(1), BlockState::Free);
        assert_eq!(piece.peer(1), None);
        assert!(!piece.has_open_blocks());
    }

    #[test]
    fn test_end_game_num_peers() {
        let mut piece = PartialPiece::new(0, 2 * BLOCK_SIZE);
        piece.request(0, addr(1));
        piece.request(0, addr(2));
        assert_eq!(piece.num_peers(0), 2);
        // One peer cancelling leaves the block requested.
        piece.abort(0, Some(addr(2)));
        assert_eq!(piece.state(0), BlockState::Requested { num_peers: 1 });
    }

    #[test]
    fn test_duplicate_receive_detected() {
        let mut piece = PartialPiece::new(0, BLOCK_SIZE);
        piece.request(0, addr(1));
        assert!(piece.received(0, addr(1)));
        assert!(!piece.received(0, addr(2)));
    }

    #[test]
    fn test_abort_peer_frees_only_theirs() {
        let mut piece = PartialPiece::new(0, 3 * BLOCK_SIZE);
        piece.request(0, addr(1));
        piece.request(1, addr(2));
        piece.request(2, addr(1));
        let freed = piece.abort_peer(addr(1));
        assert_eq!(freed, vec![0, 2]);
        assert_eq!(piece.state(1), BlockState::Requested { num_peers: 1 });
    }

    #[test]
    fn test_speed_is_monotonic() {
        let mut piece = PartialPiece::new(0, BLOCK_SIZE);
        piece.update_speed(PieceSpeed::Fast);
        piece.update_speed(PieceSpeed::Slow);
        assert_eq!(piece.speed, PieceSpeed::Fast);
    }
}
