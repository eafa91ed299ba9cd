use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};
use crate::config::SeedChokeAlgorithm;

// Optimistic slot rotates every third choke round.
const OPTIMISTIC_ROTATION: u64 = 3;

// Rate threshold growth per slot for the rate-based slot count.
const RATE_THRESHOLD_STEP: u64 = 2048;

// Snapshot of one candidate peer, taken by the torrent on each round.
#[derive(Debug, Clone)]
pub struct ChokeCandidate {

    pub address: SocketAddr,

    // Payload rate from the peer over the last round.
    pub download_rate: u64,

    // Payload rate to the peer over the last round.
    pub upload_rate: u64,

    pub peer_interested: bool,

    // Currently choked by us.
    pub choked: bool,

    pub last_unchoked: Option<Instant>,

    pub uploaded_since_unchoke: u64,

    pub num_pieces: usize,

    // Configurable per-peer priority; higher wins ties.
    pub priority: u8,

    // Connected within the last rotation window; weighted into the
    // optimistic pick.
    pub is_new: bool,

}

#[derive(Debug, Clone)]
pub struct ChokerSettings {

    // Fixed slot count; None selects the rate-based policy.
    pub unchoke_slots: Option<usize>,

    pub rate_threshold_initial: u64,

    pub seed_algorithm: SeedChokeAlgorithm,

    pub seeding_piece_quota: usize,

    pub piece_len: usize,

    pub total_size: u64,

}

#[derive(Debug, Default)]
pub struct Unchokes {

    pub regular: Vec<SocketAddr>,

    pub optimistic: Option<SocketAddr>,

}

// Periodic upload-slot assignment. The torrent feeds it snapshots every
// unchoke interval and applies the returned choke/unchoke deltas.
#[derive(Debug, Default)]
pub struct Choker {

    round: u64,

    optimistic: Option<SocketAddr>,

    // Round at which each peer last held the optimistic slot.
    last_optimistic: HashMap<SocketAddr, u64>,

}

impl Choker {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&mut self, mut peers: Vec<ChokeCandidate>, seeding: bool, settings: &ChokerSettings) -> Unchokes {
        self.round += 1;

        let slots = match settings.unchoke_slots {
            Some(slots) => slots,
            None => self.rate_based_slots(&peers, settings),
        };

        if seeding {
            self.sort_seed(&mut peers, settings);
        } else {
            self.sort_leech(&mut peers);
        }

        let regular: Vec<SocketAddr> = peers
            .iter()
            .filter(|p| p.peer_interested)
            .take(slots)
            .map(|p| p.address)
            .collect();

        // Rotate the optimistic slot every few rounds among the
        // interested peers left choked, longest-waiting first with new
        // peers weighted ahead.
        if self.round % OPTIMISTIC_ROTATION == 1 || self.optimistic.is_none() {
            self.optimistic = self.pick_optimistic(&peers, &regular);
        }
        if let Some(opt) = self.optimistic {
            if !peers.iter().any(|p| p.address == opt) {
                // The peer went away; re-pick immediately.
                self.optimistic = self.pick_optimistic(&peers, &regular);
            }
        }
        if let Some(opt) = self.optimistic {
            self.last_optimistic.insert(opt, self.round);
        }

        self.last_optimistic.retain(|addr, _| peers.iter().any(|p| p.address == *addr));

        // A peer already holding a regular slot doesn't need the
        // optimistic one on top.
        let optimistic = self.optimistic.filter(|opt| {
            peers.iter().any(|p| p.address == *opt) && !regular.contains(opt)
        });

        Unchokes { regular, optimistic }
    }

    // Walk peers by upload rate in decreasing order, adding slots while
    // the rate clears a threshold that grows per slot. Balances few fat
    // pipes against saturating the uplink.
    fn rate_based_slots(&self, peers: &[ChokeCandidate], settings: &ChokerSettings) -> usize {
        let mut sorted: Vec<&ChokeCandidate> = peers.iter().collect();
        sorted.sort_by(|a, b| {
            (b.upload_rate * b.priority as u64).cmp(&(a.upload_rate * a.priority as u64))
        });

        let mut slots = 0;
        let mut threshold = settings.rate_threshold_initial;
        for peer in sorted {
            if peer.upload_rate < threshold {
                break;
            }
            slots += 1;
            threshold += RATE_THRESHOLD_STEP;
        }
        // Always at least one slot.
        slots + 1
    }

    // Leechers reward the peers we download from the fastest; peer
    // priority and unchoke age only break ties.
    fn sort_leech(&self, peers: &mut [ChokeCandidate]) {
        peers.sort_by(|a, b| {
            b.download_rate
                .cmp(&a.download_rate)
                .then(b.priority.cmp(&a.priority))
                .then(cmp_last_unchoked(a, b))
        });
    }

    fn sort_seed(&self, peers: &mut [ChokeCandidate], settings: &ChokerSettings) {
        match settings.seed_algorithm {

            SeedChokeAlgorithm::RoundRobin => {
                let quota = (settings.seeding_piece_quota * settings.piece_len) as u64;
                peers.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(quota_complete(a, quota).cmp(&quota_complete(b, quota)))
                        .then_with(|| {
                            // Keep the status quo between peers inside
                            // their quota.
                            let a_rate = if a.choked { 0 } else { a.upload_rate };
                            let b_rate = if b.choked { 0 } else { b.upload_rate };
                            b_rate.cmp(&a_rate)
                        })
                        .then(cmp_last_unchoked(a, b))
                });
            }

            SeedChokeAlgorithm::FastestUpload => {
                peers.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(b.upload_rate.cmp(&a.upload_rate))
                        .then(cmp_last_unchoked(a, b))
                });
            }

            SeedChokeAlgorithm::AntiLeech => {
                let total = settings.total_size;
                let piece_len = settings.piece_len;
                peers.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(
                            anti_leech_score(b, total, piece_len)
                                .cmp(&anti_leech_score(a, total, piece_len)),
                        )
                        .then(cmp_last_unchoked(a, b))
                });
            }
        }
    }

    fn pick_optimistic(&self, peers: &[ChokeCandidate], regular: &[SocketAddr]) -> Option<SocketAddr> {
        peers
            .iter()
            .filter(|p| p.peer_interested && p.choked && !regular.contains(&p.address))
            .max_by_key(|p| {
                let waited = self
                    .last_optimistic
                    .get(&p.address)
                    .map(|last| self.round - last)
                    .unwrap_or(u64::MAX / 4);
                let weight: u64 = if p.is_new { 3 } else { 1 };
                (waited.saturating_mul(weight), std::cmp::Reverse(p.address))
            })
            .map(|p| p.address)
    }
}

// Oldest unchoke first; never-unchoked peers have waited the longest.
fn cmp_last_unchoked(a: &ChokeCandidate, b: &ChokeCandidate) -> std::cmp::Ordering {
    match (a.last_unchoked, b.last_unchoked) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

// A peer that pulled more than its quota inside a minute of unchoke is
// done with its slot.
fn quota_complete(peer: &ChokeCandidate, quota: u64) -> bool {
    !peer.choked
        && peer.uploaded_since_unchoke > quota
        && peer
            .last_unchoked
            .map(|at| at.elapsed() > Duration::from_secs(60))
            .unwrap_or(false)
}

// Rank peers that just started and peers that are close to done over
// peers in the middle of a download.
fn anti_leech_score(peer: &ChokeCandidate, total_size: u64, piece_len: usize) -> u64 {
    if total_size == 0 {
        return 0;
    }
    let have = (peer.num_pieces * piece_len) as i64;
    let half = total_size as i64 / 2;
    ((have - half).unsigned_abs() * 2000) / total_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{}:6881", n).parse().unwrap()
    }

    fn candidate(n: u8) -> ChokeCandidate {
        ChokeCandidate {
            address: addr(n),
            download_rate: 0,
            upload_rate: 0,
            peer_interested: true,
            choked: true,
            last_unchoked: None,
            uploaded_since_unchoke: 0,
            num_pieces: 0,
            priority: 1,
            is_new: false,
        }
    }

    fn settings() -> ChokerSettings {
        ChokerSettings {
            unchoke_slots: Some(4),
            rate_threshold_initial: 1024,
            seed_algorithm: SeedChokeAlgorithm::RoundRobin,
            seeding_piece_quota: 20,
            piece_len: 0x4000,
            total_size: 100 * 0x4000,
        }
    }

    #[test]
    fn test_leech_unchokes_fastest_downloads() {
        let mut choker = Choker::new();
        let peers: Vec<ChokeCandidate> = (1..=8)
            .map(|n| {
                let mut c = candidate(n);
                c.download_rate = n as u64 * 1000;
                c
            })
            .collect();
        let unchokes = choker.run(peers, false, &settings());
        assert_eq!(unchokes.regular, vec![addr(8), addr(7), addr(6), addr(5)]);
    }

    #[test]
    fn test_uninterested_peers_get_no_slot() {
        let mut choker = Choker::new();
        let mut peers: Vec<ChokeCandidate> = (1..=4).map(candidate).collect();
        peers[0].peer_interested = false;
        peers[0].download_rate = 9999;
        let unchokes = choker.run(peers, false, &settings());
        assert!(!unchokes.regular.contains(&addr(1)));
    }

    #[test]
    fn test_rate_based_slot_count() {
        let choker = Choker::new();
        let mut peers = Vec::new();
        // Rates 20k, 18k, ... 2k; threshold 1k growing by 2k per slot:
        // 20k>=1k, 18k>=3k, 16k>=5k, 14k>=7k, 12k>=9k, 10k<11k stops.
        for n in 1..=10u8 {
            let mut c = candidate(n);
            c.upload_rate = (22 - 2 * n as u64) * 1000;
            peers.push(c);
        }
        let mut s = settings();
        s.unchoke_slots = None;
        s.rate_threshold_initial = 1000;
        assert_eq!(choker.rate_based_slots(&peers, &s), 6);
        // No qualifying peers still leaves a single slot.
        assert_eq!(choker.rate_based_slots(&[], &s), 1);
    }

    #[test]
    fn test_optimistic_rotation_covers_all_choked() {
        // Four fast peers hold the regular slots; the six slow ones
        // must each get an optimistic turn within 30 rounds.
        let mut choker = Choker::new();
        let mut seen = std::collections::HashSet::new();

        for _ in 0..30 {
            let mut peers: Vec<ChokeCandidate> = (1..=10).map(candidate).collect();
            for p in peers.iter_mut().take(4) {
                p.download_rate = 10_000;
                p.choked = false;
            }
            let unchokes = choker.run(peers, false, &settings());
            assert_eq!(unchokes.regular.len(), 4);
            if let Some(opt) = unchokes.optimistic {
                seen.insert(opt);
            }
        }

        for n in 5..=10 {
            assert!(seen.contains(&addr(n)), "peer {} never optimistically unchoked", n);
        }
    }

    #[test]
    fn test_optimistic_rotation_with_no_regular_slots() {
        let mut choker = Choker::new();
        let mut s = settings();
        s.unchoke_slots = Some(0);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..30 {
            let peers: Vec<ChokeCandidate> = (1..=10).map(candidate).collect();
            if let Some(opt) = choker.run(peers, false, &s).optimistic {
                seen.insert(opt);
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn test_new_peer_weighted_into_optimistic() {
        let mut choker = Choker::new();
        let mut s = settings();
        s.unchoke_slots = Some(0);
        let mut peers: Vec<ChokeCandidate> = (1..=5).map(candidate).collect();
        peers[4].is_new = true;
        // All have waited equally; the new peer's weight breaks the tie.
        let unchokes = choker.run(peers, false, &s);
        assert_eq!(unchokes.optimistic, Some(addr(5)));
    }

    #[test]
    fn test_seed_fastest_upload_ranking() {
        let mut choker = Choker::new();
        let mut s = settings();
        s.seed_algorithm = SeedChokeAlgorithm::FastestUpload;
        s.unchoke_slots = Some(2);
        let peers: Vec<ChokeCandidate> = (1..=4)
            .map(|n| {
                let mut c = candidate(n);
                c.upload_rate = n as u64 * 500;
                c
            })
            .collect();
        let unchokes = choker.run(peers, true, &s);
        assert_eq!(unchokes.regular, vec![addr(4), addr(3)]);
    }

    #[test]
    fn test_seed_round_robin_rotates_quota_complete() {
        let mut choker = Choker::new();
        let mut s = settings();
        s.unchoke_slots = Some(1);
        s.seeding_piece_quota = 1;
        let mut peers: Vec<ChokeCandidate> = (1..=2).map(candidate).collect();
        // Peer 1 is unchoked and has pulled far past its quota for over
        // a minute; peer 2 takes the slot.
        peers[0].choked = false;
        peers[0].uploaded_since_unchoke = 10 * 0x4000;
        peers[0].last_unchoked = Some(Instant::now() - Duration::from_secs(120));
        let unchokes = choker.run(peers, true, &s);
        assert_eq!(unchokes.regular, vec![addr(2)]);
    }

    #[test]
    fn test_anti_leech_score_shape() {
        let total = 100 * 0x4000u64;
        let piece_len = 0x4000;
        let empty = {
            let mut c = candidate(1);
            c.num_pieces = 0;
            c
        };
        let half = {
            let mut c = candidate(2);
            c.num_pieces = 50;
            c
        };
        let full = {
            let mut c = candidate(3);
            c.num_pieces = 100;
            c
        };
        // Extremes score high, the middle scores zero.
        assert_eq!(anti_leech_score(&empty, total, piece_len), 1000);
        assert_eq!(anti_leech_score(&half, total, piece_len), 0);
        assert_eq!(anti_leech_score(&full, total, piece_len), 1000);
    }

    #[test]
    fn test_rate_beats_priority_for_leechers() {
        let mut choker = Choker::new();
        let mut s = settings();
        s.unchoke_slots = Some(1);
        let mut peers: Vec<ChokeCandidate> = (1..=2).map(candidate).collect();
        peers[0].download_rate = 10_000;
        peers[1].download_rate = 100;
        peers[1].priority = 5;
        // Download rate is the primary key; priority can't buy a slot.
        let unchokes = choker.run(peers, false, &s);
        assert_eq!(unchokes.regular, vec![addr(1)]);
    }

    #[test]
    fn test_priority_breaks_rate_ties() {
        let mut choker = Choker::new();
        let mut s = settings();
        s.unchoke_slots = Some(1);
        let mut peers: Vec<ChokeCandidate> = (1..=2).map(candidate).collect();
        peers[0].download_rate = 5000;
        peers[1].download_rate = 5000;
        peers[1].priority = 5;
        let unchokes = choker.run(peers, false, &s);
        assert_eq!(unchokes.regular, vec![addr(2)]);
    }
}
