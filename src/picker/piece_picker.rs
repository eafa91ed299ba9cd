use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
};
use rand::Rng;
use crate::{
    block::{num_blocks, BlockInfo},
    Bitfield, BLOCK_SIZE,
};
use super::partial_piece::{BlockState, PartialPiece, PieceSpeed};

// Piece priority levels. 0 excludes the piece from selection entirely,
// 1 is the default, 7 the strongest boost.
pub const PRIORITY_FILTERED: u8 = 0;
pub const PRIORITY_NORMAL: u8 = 1;
pub const PRIORITY_MAX: u8 = 7;

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {

    // Number of connected peers that have this piece.
    availability: u16,

    priority: u8,

}

#[derive(Debug, Clone)]
pub struct PickOptions {

    pub num_blocks: usize,

    // When > 0, request whole pieces at a time, up to this many,
    // expanding into the peer's next sequential piece at boundaries.
    pub prefer_whole_pieces: usize,

    pub speed: PieceSpeed,

    // A peer on parole only re-downloads pieces it already has blocks
    // in, so a hash failure can be pinned on it.
    pub on_parole: bool,

    // Piece the peer suggested; tried before the bucket walk.
    pub suggested: Option<usize>,

}

impl Default for PickOptions {
    fn default() -> Self {
        Self {
            num_blocks: 1,
            prefer_whole_pieces: 0,
            speed: PieceSpeed::default(),
            on_parole: false,
            suggested: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Picked {

    pub blocks: Vec<BlockInfo>,

    // Busy blocks, returned only when the pick underfills. Callers may
    // request these redundantly (end-game) but must cancel on first
    // receipt.
    pub backup: Vec<BlockInfo>,

}

// Pieces bucketed by effective priority, derived from user priority and
// availability, so that walking buckets in ascending order yields
// rarest-first with priority boosts layered on top.
#[derive(Debug)]
pub struct PiecePicker {

    pieces: Vec<PieceInfo>,

    // The pieces that we have.
    have: Bitfield,

    // Bucket number -> piece indices. Partitions exactly the pieces that
    // are neither had nor filtered.
    buckets: BTreeMap<u32, Vec<usize>>,

    // Per-block state for pieces with at least one requested block.
    downloading: HashMap<usize, PartialPiece>,

    piece_len: usize,

    last_piece_len: usize,

    // Availability clamp; at the clamp equal-priority pieces are picked
    // in index order instead of shuffled.
    sequential_threshold: Option<u16>,

    num_have: usize,

}

impl PiecePicker {

    pub fn new(num_pieces: usize, piece_len: usize, last_piece_len: usize) -> Self {
        let mut picker = Self {
            pieces: vec![
                PieceInfo { availability: 0, priority: PRIORITY_NORMAL };
                num_pieces
            ],
            have: Bitfield::repeat(false, num_pieces),
            buckets: BTreeMap::new(),
            downloading: HashMap::new(),
            piece_len,
            last_piece_len,
            sequential_threshold: None,
            num_have: 0,
        };
        for idx in 0..num_pieces {
            picker.insert_into_bucket(idx);
        }
        picker
    }

    pub fn set_sequential_threshold(&mut self, threshold: Option<u16>) {
        self.sequential_threshold = threshold;
        self.rebuild_buckets();
    }

    // Sequential download is the threshold at zero: every bucket keeps
    // index order.
    pub fn set_sequential(&mut self, sequential: bool) {
        self.set_sequential_threshold(if sequential { Some(0) } else { None });
    }

    pub fn piece_len(&self, idx: usize) -> usize {
        if idx == self.pieces.len() - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn num_have(&self) -> usize {
        self.num_have
    }

    pub fn is_seed(&self) -> bool {
        self.num_have == self.pieces.len()
    }

    pub fn num_downloading(&self) -> usize {
        self.downloading.len()
    }

    pub fn availability(&self, idx: usize) -> u16 {
        self.pieces[idx].availability
    }

    pub fn priority(&self, idx: usize) -> u8 {
        self.pieces[idx].priority
    }

    // Availability clamped for bucket purposes.
    fn clamped_availability(&self, idx: usize) -> u32 {
        let avail = self.pieces[idx].availability as u32;
        match self.sequential_threshold {
            Some(t) => avail.min(t as u32),
            None => avail,
        }
    }

    // Bucket a piece sorts into, None for had or filtered pieces.
    fn effective_priority(&self, idx: usize) -> Option<u32> {
        if self.have[idx] {
            return None;
        }
        let k = self.clamped_availability(idx);
        match self.pieces[idx].priority {
            PRIORITY_FILTERED => None,
            1 => Some(2 * k),
            2 => Some((2 * k).saturating_sub(1)),
            3 => Some(k),
            // Top levels pin the piece to a fixed low bucket regardless
            // of availability: 4 -> 4 down to 7 -> 1.
            p => Some(8u32.saturating_sub(p as u32).max(1)),
        }
    }

    // Buckets at the sequential clamp keep index order; the rest get a
    // random insert position so equally-rare pieces decorrelate across
    // peers.
    fn in_index_order(&self, idx: usize) -> bool {
        match self.sequential_threshold {
            Some(t) => self.pieces[idx].availability as u32 >= t as u32,
            None => false,
        }
    }

    fn insert_into_bucket(&mut self, idx: usize) {
        let Some(bucket_num) = self.effective_priority(idx) else {
            return;
        };
        let ordered = self.in_index_order(idx);
        let bucket = self.buckets.entry(bucket_num).or_default();
        if ordered {
            let pos = bucket.partition_point(|&p| p < idx);
            bucket.insert(pos, idx);
        } else if bucket.is_empty() {
            bucket.push(idx);
        } else {
            let pos = rand::thread_rng().gen_range(0..=bucket.len());
            bucket.insert(pos, idx);
        }
    }

    fn remove_from_bucket(&mut self, idx: usize) {
        let Some(bucket_num) = self.effective_priority(idx) else {
            return;
        };
        if let Some(bucket) = self.buckets.get_mut(&bucket_num) {
            bucket.retain(|&p| p != idx);
            if bucket.is_empty() {
                self.buckets.remove(&bucket_num);
            }
        }
    }

    fn rebuild_buckets(&mut self) {
        self.buckets.clear();
        for idx in 0..self.pieces.len() {
            self.insert_into_bucket(idx);
        }
        #[cfg(debug_assertions)]
        self.check_invariant();
    }

    // One more peer advertises the piece.
    pub fn inc_refcount(&mut self, idx: usize) {
        self.remove_from_bucket(idx);
        self.pieces[idx].availability += 1;
        self.insert_into_bucket(idx);
    }

    // A peer advertising the piece went away. No rebucketing for pieces
    // we already have.
    pub fn dec_refcount(&mut self, idx: usize) {
        if self.pieces[idx].availability == 0 {
            return;
        }
        if self.have[idx] {
            self.pieces[idx].availability -= 1;
            return;
        }
        self.remove_from_bucket(idx);
        self.pieces[idx].availability -= 1;
        self.insert_into_bucket(idx);
    }

    // Fold a whole bitfield in when a peer connects. Returns true if the
    // peer has a piece we still need.
    pub fn peer_joined(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.pieces.len());
        let mut interested = false;
        for (idx, has) in bf.iter().enumerate() {
            if *has {
                self.inc_refcount(idx);
                if self.needs_piece(idx) {
                    interested = true;
                }
            }
        }
        interested
    }

    pub fn peer_left(&mut self, bf: &Bitfield) {
        debug_assert_eq!(bf.len(), self.pieces.len());
        for (idx, has) in bf.iter().enumerate() {
            if *has {
                self.dec_refcount(idx);
            }
        }
    }

    fn needs_piece(&self, idx: usize) -> bool {
        !self.have[idx] && self.pieces[idx].priority != PRIORITY_FILTERED
    }

    // Whether the peer has any piece we still want.
    pub fn needed_pieces(&self, bf: &Bitfield) -> bool {
        bf.iter().enumerate().any(|(idx, has)| *has && self.needs_piece(idx))
    }

    // The piece passed its hash check: out of every bucket, download
    // record dropped.
    pub fn we_have(&mut self, idx: usize) {
        if self.have[idx] {
            return;
        }
        self.remove_from_bucket(idx);
        self.have.set(idx, true);
        self.num_have += 1;
        self.downloading.remove(&idx);
        #[cfg(debug_assertions)]
        self.check_invariant();
    }

    // Returns true when the change crosses the filtered boundary in
    // either direction.
    pub fn set_priority(&mut self, idx: usize, priority: u8) -> bool {
        debug_assert!(priority <= PRIORITY_MAX);
        let old = self.pieces[idx].priority;
        if old == priority {
            return false;
        }
        self.remove_from_bucket(idx);
        self.pieces[idx].priority = priority;
        self.insert_into_bucket(idx);
        (old == PRIORITY_FILTERED) != (priority == PRIORITY_FILTERED)
    }

    // Hash failure: the download record is dropped wholesale and the
    // piece becomes pickable again from scratch.
    pub fn restore_piece(&mut self, idx: usize) -> Option<Vec<SocketAddr>> {
        let piece = self.downloading.remove(&idx)?;
        Some(piece.contributors())
    }

    pub fn downloading_piece(&self, idx: usize) -> Option<&PartialPiece> {
        self.downloading.get(&idx)
    }

    pub fn is_downloading(&self, block: &BlockInfo) -> bool {
        self.downloading
            .get(&block.piece_idx)
            .map(|p| {
                matches!(
                    p.state(block.idx_in_piece()),
                    BlockState::Requested { .. } | BlockState::Writing
                )
            })
            .unwrap_or(false)
    }

    pub fn is_finished(&self, block: &BlockInfo) -> bool {
        self.downloading
            .get(&block.piece_idx)
            .map(|p| p.state(block.idx_in_piece()) == BlockState::Finished)
            .unwrap_or(self.have[block.piece_idx])
    }

    pub fn num_peers(&self, block: &BlockInfo) -> u16 {
        self.downloading
            .get(&block.piece_idx)
            .map(|p| p.num_peers(block.idx_in_piece()))
            .unwrap_or(0)
    }

    // Total payload bytes represented by finished blocks.
    pub fn finished_bytes(&self) -> u64 {
        let have_bytes: u64 = (0..self.pieces.len())
            .filter(|&i| self.have[i])
            .map(|i| self.piece_len(i) as u64)
            .sum();
        let partial_bytes: u64 = self
            .downloading
            .values()
            .map(|p| {
                (0..p.num_blocks())
                    .filter(|&b| p.state(b) == BlockState::Finished)
                    .map(|b| p.block_info(b).len as u64)
                    .sum::<u64>()
            })
            .sum();
        have_bytes + partial_bytes
    }

    // How many full copies of the torrent the swarm holds: the integer
    // part is the minimum availability over unfiltered pieces (our own
    // copy included), the fraction the share of pieces above it.
    pub fn distributed_copies(&self) -> (u32, f32) {
        let avail = |idx: usize| self.pieces[idx].availability as u32 + u32::from(self.have[idx]);
        let unfiltered = || {
            (0..self.pieces.len()).filter(|&i| self.pieces[i].priority != PRIORITY_FILTERED)
        };
        let total = unfiltered().count() as u32;
        if total == 0 {
            return (0, 0.0);
        }
        let min_avail = unfiltered().map(avail).min().unwrap();
        let above = unfiltered().filter(|&i| avail(i) > min_avail).count() as u32;
        (min_avail, above as f32 / total as f32)
    }

    // Transition a block None -> Requested (lazily creating the download
    // record) or stack an end-game request.
    pub fn mark_requesting(&mut self, block: &BlockInfo, peer: SocketAddr, speed: PieceSpeed) {
        let len = self.piece_len(block.piece_idx);
        let piece = self
            .downloading
            .entry(block.piece_idx)
            .or_insert_with(|| PartialPiece::new(block.piece_idx, len));
        piece.request(block.idx_in_piece(), peer);
        piece.update_speed(speed);
    }

    // Requested -> Writing. Returns false for blocks we weren't waiting
    // on (duplicate end-game arrivals, spam).
    pub fn mark_writing(&mut self, block: &BlockInfo, peer: SocketAddr) -> bool {
        match self.downloading.get_mut(&block.piece_idx) {
            Some(piece) => piece.received(block.idx_in_piece(), peer),
            None => false,
        }
    }

    // Writing -> Finished. Returns true when the whole piece is finished
    // and ready for its hash check.
    pub fn mark_finished(&mut self, block: &BlockInfo) -> bool {
        match self.downloading.get_mut(&block.piece_idx) {
            Some(piece) => {
                piece.finished(block.idx_in_piece());
                piece.all_finished()
            }
            None => false,
        }
    }

    // Requested -> None. The record is reaped once nothing in it is
    // requested or written.
    pub fn abort_download(&mut self, block: &BlockInfo, peer: Option<SocketAddr>) {
        if let Some(piece) = self.downloading.get_mut(&block.piece_idx) {
            piece.abort(block.idx_in_piece(), peer);
            if !piece.has_open_blocks() {
                self.downloading.remove(&block.piece_idx);
            }
        }
    }

    // Free everything a departing peer had on request.
    pub fn abort_peer(&mut self, peer: SocketAddr) {
        let idxs: Vec<usize> = self.downloading.keys().copied().collect();
        for idx in idxs {
            if let Some(piece) = self.downloading.get_mut(&idx) {
                piece.abort_peer(peer);
                if !piece.has_open_blocks() {
                    self.downloading.remove(&idx);
                }
            }
        }
    }

    // Stage up to num_blocks blocks the peer can serve, walking buckets
    // in ascending order. Underfilled picks return busy blocks in
    // `backup` for end-game use. Nothing is marked requested here; the
    // caller marks what it actually sends.
    pub fn pick(&mut self, bf: &Bitfield, peer: SocketAddr, opts: &PickOptions) -> Picked {
        let mut picked = Picked::default();
        let mut staged: std::collections::HashSet<usize> = std::collections::HashSet::new();
        if bf.not_any() {
            return picked;
        }

        if opts.on_parole {
            // A parole peer is confined to pieces that hold only its own
            // work, so a later hash failure can be pinned on it.
            let mut idxs: Vec<usize> = self.downloading.keys().copied().collect();
            idxs.sort_unstable();
            for idx in idxs {
                if bf[idx] && self.needs_piece(idx) && self.downloading[&idx].exclusive_to(peer) {
                    self.stage_partial(idx, opts.num_blocks, &mut picked);
                }
                if picked.blocks.len() >= opts.num_blocks {
                    break;
                }
            }
            picked.backup.clear();
            return picked;
        }

        if let Some(idx) = opts.suggested {
            if idx < self.pieces.len() && bf[idx] && self.needs_piece(idx) {
                self.stage_piece(idx, bf, opts, &mut picked, &mut staged);
            }
        }

        let bucket_nums: Vec<u32> = self.buckets.keys().copied().collect();
        'walk: for bucket_num in bucket_nums {
            let candidates = self.buckets.get(&bucket_num).cloned().unwrap_or_default();

            // Partial pieces come first, those in the peer's speed class
            // ahead of the rest, so open pieces close quickly.
            let mut order: Vec<usize> = Vec::with_capacity(candidates.len());
            order.extend(candidates.iter().copied().filter(|idx| {
                self.downloading.get(idx).map(|p| p.speed == opts.speed).unwrap_or(false)
            }));
            order.extend(candidates.iter().copied().filter(|idx| {
                self.downloading.contains_key(idx)
                    && self.downloading[idx].speed != opts.speed
            }));
            order.extend(candidates.iter().copied().filter(|idx| !self.downloading.contains_key(idx)));

            for idx in order {
                if picked.blocks.len() >= opts.num_blocks {
                    break 'walk;
                }
                if !bf[idx] {
                    continue;
                }
                self.stage_piece(idx, bf, opts, &mut picked, &mut staged);
            }
        }

        if picked.blocks.len() >= opts.num_blocks {
            picked.backup.clear();
        }
        picked
    }

    fn stage_piece(
        &mut self,
        idx: usize,
        bf: &Bitfield,
        opts: &PickOptions,
        picked: &mut Picked,
        staged: &mut std::collections::HashSet<usize>,
    ) {
        if !staged.insert(idx) {
            return;
        }
        if self.downloading.contains_key(&idx) {
            self.stage_partial(idx, opts.num_blocks, picked);
            return;
        }

        if opts.prefer_whole_pieces > 0 {
            // Whole pieces, expanding across the boundary into the next
            // sequential piece the peer has.
            let mut whole_budget = opts.prefer_whole_pieces;
            let mut next = idx;
            while whole_budget > 0 && next < self.pieces.len() {
                if bf[next]
                    && self.needs_piece(next)
                    && !self.downloading.contains_key(&next)
                    && (next == idx || staged.insert(next))
                {
                    let blocks = num_blocks(self.piece_len(next)) as usize;
                    for b in 0..blocks {
                        picked.blocks.push(self.block_at(next, b));
                    }
                    whole_budget -= 1;
                }
                next += 1;
            }
            return;
        }

        let blocks = num_blocks(self.piece_len(idx)) as usize;
        for b in 0..blocks {
            if picked.blocks.len() >= opts.num_blocks {
                break;
            }
            picked.blocks.push(self.block_at(idx, b));
        }
    }

    // Free blocks out of a piece under download; busy ones feed the
    // end-game backup list.
    fn stage_partial(&mut self, idx: usize, budget: usize, picked: &mut Picked) {
        let piece = &self.downloading[&idx];
        for b in 0..piece.num_blocks() {
            match piece.state(b) {
                BlockState::Free => {
                    if picked.blocks.len() < budget {
                        picked.blocks.push(piece.block_info(b));
                    }
                }
                BlockState::Requested { num_peers } if num_peers >= 1 && picked.backup.len() < budget => {
                    picked.backup.push(piece.block_info(b));
                }
                _ => {}
            }
        }
    }

    fn block_at(&self, piece_idx: usize, block_idx: usize) -> BlockInfo {
        BlockInfo {
            piece_idx,
            offset: block_idx * BLOCK_SIZE,
            len: crate::block::block_len(self.piece_len(piece_idx), block_idx),
        }
    }

    #[cfg(debug_assertions)]
    fn check_invariant(&self) {
        // Buckets partition exactly the pieces that are neither had nor
        // filtered.
        let mut seen = vec![false; self.pieces.len()];
        for (num, bucket) in &self.buckets {
            for &idx in bucket {
                assert!(!seen[idx], "piece {} in two buckets", idx);
                seen[idx] = true;
                assert_eq!(self.effective_priority(idx), Some(*num));
            }
        }
        for idx in 0..self.pieces.len() {
            assert_eq!(
                seen[idx],
                self.effective_priority(idx).is_some(),
                "bucket membership wrong for piece {}",
                idx,
            );
        }
        for piece in self.downloading.values() {
            assert!(
                piece.has_open_blocks(),
                "empty download record for piece {}",
                piece.idx,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", n).parse().unwrap()
    }

    fn all_bits(n: usize) -> Bitfield {
        Bitfield::repeat(true, n)
    }

    fn picker(num_pieces: usize) -> PiecePicker {
        PiecePicker::new(num_pieces, 2 * BLOCK_SIZE, 2 * BLOCK_SIZE)
    }

    #[test]
    fn test_pick_from_empty_peer() {
        let mut p = picker(8);
        let bf = Bitfield::repeat(false, 8);
        let picked = p.pick(&bf, addr(1), &PickOptions { num_blocks: 4, ..Default::default() });
        assert!(picked.blocks.is_empty());
        assert!(picked.backup.is_empty());
    }

    #[test]
    fn test_pick_when_all_have() {
        let mut p = picker(4);
        for i in 0..4 {
            p.we_have(i);
        }
        let picked = p.pick(&all_bits(4), addr(1), &PickOptions { num_blocks: 4, ..Default::default() });
        assert!(picked.blocks.is_empty());
        assert_eq!(p.num_downloading(), 0);
    }

    #[test]
    fn test_rarest_first() {
        let mut p = picker(4);
        // Piece 2 is rarest: one peer. The rest are on three peers.
        for i in [0, 1, 3] {
            for _ in 0..3 {
                p.inc_refcount(i);
            }
        }
        p.inc_refcount(2);
        let picked = p.pick(&all_bits(4), addr(1), &PickOptions { num_blocks: 2, ..Default::default() });
        assert!(picked.blocks.iter().all(|b| b.piece_idx == 2));
    }

    #[test]
    fn test_priority_beats_availability() {
        let mut p = picker(4);
        for i in 0..4 {
            p.inc_refcount(i);
        }
        // Max priority pins piece 3 to bucket 1, under every
        // availability bucket.
        p.set_priority(3, PRIORITY_MAX);
        assert_eq!(p.priority(3), PRIORITY_MAX);
        let picked = p.pick(&all_bits(4), addr(1), &PickOptions { num_blocks: 2, ..Default::default() });
        assert!(picked.blocks.iter().all(|b| b.piece_idx == 3));
    }

    #[test]
    fn test_filtered_never_picked() {
        let mut p = picker(2);
        assert!(p.set_priority(0, PRIORITY_FILTERED));
        let picked = p.pick(&all_bits(2), addr(1), &PickOptions { num_blocks: 64, ..Default::default() });
        assert!(picked.blocks.iter().all(|b| b.piece_idx == 1));
        // And it comes back when unfiltered.
        assert!(p.set_priority(0, PRIORITY_NORMAL));
        assert!(!p.set_priority(0, 2));
    }

    #[test]
    fn test_sequential_mode_orders_by_index() {
        let mut p = picker(6);
        p.set_sequential(true);
        for i in 0..6 {
            p.inc_refcount(i);
        }
        let picked = p.pick(&all_bits(6), addr(1), &PickOptions { num_blocks: 4, ..Default::default() });
        assert_eq!(picked.blocks[0].piece_idx, 0);
        assert_eq!(picked.blocks[1].piece_idx, 0);
        assert_eq!(picked.blocks[2].piece_idx, 1);
        assert_eq!(picked.blocks[3].piece_idx, 1);
    }

    #[test]
    fn test_request_then_abort_is_idempotent() {
        let mut p = picker(4);
        let block = BlockInfo { piece_idx: 1, offset: 0, len: BLOCK_SIZE };
        p.mark_requesting(&block, addr(1), PieceSpeed::Slow);
        assert!(p.is_downloading(&block));
        assert_eq!(p.num_downloading(), 1);
        p.abort_download(&block, Some(addr(1)));
        assert!(!p.is_downloading(&block));
        // Record reaped, picker back to its pre-request state.
        assert_eq!(p.num_downloading(), 0);
    }

    #[test]
    fn test_block_write_finish_flow() {
        let mut p = picker(2);
        let b0 = BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE };
        let b1 = BlockInfo { piece_idx: 0, offset: BLOCK_SIZE, len: BLOCK_SIZE };
        p.mark_requesting(&b0, addr(1), PieceSpeed::Slow);
        p.mark_requesting(&b1, addr(1), PieceSpeed::Slow);
        assert!(p.mark_writing(&b0, addr(1)));
        assert!(!p.mark_finished(&b0));
        assert!(p.mark_writing(&b1, addr(1)));
        // Second block completes the piece.
        assert!(p.mark_finished(&b1));
        // Duplicate arrival is flagged.
        assert!(!p.mark_writing(&b0, addr(2)));
    }

    #[test]
    fn test_partial_pieces_picked_first() {
        let mut p = picker(8);
        for i in 0..8 {
            p.inc_refcount(i);
        }
        let block = BlockInfo { piece_idx: 5, offset: 0, len: BLOCK_SIZE };
        p.mark_requesting(&block, addr(1), PieceSpeed::Slow);
        // Another peer asking for one block gets the open piece's free
        // block, not a fresh piece.
        let picked = p.pick(&all_bits(8), addr(2), &PickOptions { num_blocks: 1, ..Default::default() });
        assert_eq!(picked.blocks[0].piece_idx, 5);
        assert_eq!(picked.blocks[0].offset, BLOCK_SIZE);
    }

    #[test]
    fn test_end_game_backup_blocks() {
        let mut p = picker(1);
        p.inc_refcount(0);
        let b0 = BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE };
        let b1 = BlockInfo { piece_idx: 0, offset: BLOCK_SIZE, len: BLOCK_SIZE };
        p.mark_requesting(&b0, addr(1), PieceSpeed::Slow);
        p.mark_requesting(&b1, addr(1), PieceSpeed::Slow);
        // Everything is requested: a second peer underfills and gets the
        // busy blocks as backup.
        let picked = p.pick(&all_bits(1), addr(2), &PickOptions { num_blocks: 2, ..Default::default() });
        assert!(picked.blocks.is_empty());
        assert_eq!(picked.backup.len(), 2);
        assert_eq!(p.num_peers(&b0), 1);
        // Redundant request bumps the per-block peer count.
        p.mark_requesting(&b0, addr(2), PieceSpeed::Fast);
        assert_eq!(p.num_peers(&b0), 2);
    }

    #[test]
    fn test_parole_restricted_to_downloading() {
        let mut p = picker(4);
        for i in 0..4 {
            p.inc_refcount(i);
        }
        let opts = PickOptions { num_blocks: 8, on_parole: true, ..Default::default() };
        // Nothing downloading: a parole peer gets nothing.
        let picked = p.pick(&all_bits(4), addr(1), &opts);
        assert!(picked.blocks.is_empty());

        let block = BlockInfo { piece_idx: 2, offset: 0, len: BLOCK_SIZE };
        p.mark_requesting(&block, addr(1), PieceSpeed::Slow);
        let picked = p.pick(&all_bits(4), addr(1), &opts);
        assert!(!picked.blocks.is_empty());
        assert!(picked.blocks.iter().all(|b| b.piece_idx == 2));
        // Another parole peer can't piggyback on this peer's piece.
        let picked = p.pick(&all_bits(4), addr(2), &opts);
        assert!(picked.blocks.is_empty());
    }

    #[test]
    fn test_suggested_piece_tried_first() {
        let mut p = picker(8);
        for i in 0..8 {
            p.inc_refcount(i);
        }
        let opts = PickOptions { num_blocks: 1, suggested: Some(6), ..Default::default() };
        let picked = p.pick(&all_bits(8), addr(1), &opts);
        assert_eq!(picked.blocks[0].piece_idx, 6);
    }

    #[test]
    fn test_whole_piece_expansion() {
        let mut p = picker(4);
        for i in 0..4 {
            p.inc_refcount(i);
        }
        p.set_sequential(true);
        let opts = PickOptions { num_blocks: 1, prefer_whole_pieces: 2, ..Default::default() };
        let picked = p.pick(&all_bits(4), addr(1), &opts);
        // Two whole contiguous pieces, 2 blocks each.
        assert_eq!(picked.blocks.len(), 4);
        assert_eq!(picked.blocks[0].piece_idx, 0);
        assert_eq!(picked.blocks[3].piece_idx, 1);
    }

    #[test]
    fn test_restore_piece_after_hash_failure() {
        let mut p = picker(2);
        let b0 = BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE };
        let b1 = BlockInfo { piece_idx: 0, offset: BLOCK_SIZE, len: BLOCK_SIZE };
        for b in [&b0, &b1] {
            p.mark_requesting(b, addr(7), PieceSpeed::Slow);
            p.mark_writing(b, addr(7));
            p.mark_finished(b);
        }
        let contributors = p.restore_piece(0).unwrap();
        assert_eq!(contributors, vec![addr(7)]);
        assert_eq!(p.num_downloading(), 0);
        // The piece is pickable again.
        let picked = p.pick(&all_bits(2), addr(1), &PickOptions { num_blocks: 1, ..Default::default() });
        assert!(!picked.blocks.is_empty());
    }

    #[test]
    fn test_distributed_copies() {
        let mut p = picker(4);
        for i in 0..4 {
            p.inc_refcount(i);
        }
        assert_eq!(p.distributed_copies(), (1, 0.0));
        p.inc_refcount(0);
        let (full, fraction) = p.distributed_copies();
        assert_eq!(full, 1);
        assert!((fraction - 0.25).abs() < f32::EPSILON);
        // Having a piece ourselves counts toward its availability.
        p.we_have(1);
        let (full, fraction) = p.distributed_copies();
        assert_eq!(full, 1);
        assert!((fraction - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_availability_tracks_peers() {
        let mut p = picker(3);
        let mut bf = Bitfield::repeat(false, 3);
        bf.set(0, true);
        bf.set(2, true);
        assert!(p.peer_joined(&bf));
        assert_eq!(p.availability(0), 1);
        assert_eq!(p.availability(1), 0);
        p.peer_left(&bf);
        assert_eq!(p.availability(0), 0);
    }

    #[test]
    fn test_finished_bytes() {
        let mut p = PiecePicker::new(2, 2 * BLOCK_SIZE, BLOCK_SIZE + 10);
        let b = BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE };
        p.mark_requesting(&b, addr(1), PieceSpeed::Slow);
        p.mark_writing(&b, addr(1));
        p.mark_finished(&b);
        assert_eq!(p.finished_bytes(), BLOCK_SIZE as u64);
        p.we_have(1);
        assert_eq!(p.finished_bytes(), (2 * BLOCK_SIZE + 10) as u64);
    }
}
