use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};
use super::node_id::NodeId;

// Nodes per bucket.
pub const BUCKET_SIZE: usize = 8;

// A bucket idle longer than this gets refreshed with a lookup.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

// Failed queries before a node is evicted in favor of a replacement.
const MAX_FAIL_COUNT: u8 = 3;

#[derive(Debug, Clone, Copy)]
pub struct NodeEntry {

    pub id: NodeId,

    pub addr: SocketAddr,

    pub last_seen: Instant,

    // Smoothed round-trip estimate, unset until the first response.
    pub rtt: Option<Duration>,

    // Confirmed responsive at least once; heard-about nodes start out
    // unconfirmed.
    pub confirmed: bool,

    pub fail_count: u8,

}

#[derive(Debug)]
struct Bucket {

    nodes: Vec<NodeEntry>,

    // Stand-ins promoted when a node times out of the bucket.
    replacements: Vec<NodeEntry>,

    last_changed: Instant,

}

impl Bucket {
    fn new() -> Self {
        Self {
            nodes: Vec::with_capacity(BUCKET_SIZE),
            replacements: Vec::with_capacity(BUCKET_SIZE),
            last_changed: Instant::now(),
        }
    }
}

// Standard Kademlia table: bucket i holds nodes sharing an i-bit prefix
// with our id; the bucket containing our own id keeps splitting until
// the keyspace runs out.
#[derive(Debug)]
pub struct RoutingTable {

    own_id: NodeId,

    buckets: Vec<Bucket>,

}

impl RoutingTable {

    pub fn new(own_id: NodeId) -> Self {
        Self {
            own_id,
            buckets: vec![Bucket::new()],
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn num_nodes(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.own_id
            .common_prefix_bits(id)
            .min(self.buckets.len() - 1)
    }

    // A node answered a query. Promotes it to confirmed, updates rtt,
    // and returns true if the table gained a node.
    pub fn node_seen(&mut self, id: NodeId, addr: SocketAddr, rtt: Duration) -> bool {
        if id == self.own_id {
            return false;
        }
        let idx = self.bucket_index(&id);
        let bucket = &mut self.buckets[idx];
        bucket.last_changed = Instant::now();

        if let Some(node) = bucket.nodes.iter_mut().find(|n| n.id == id) {
            node.last_seen = Instant::now();
            node.confirmed = true;
            node.fail_count = 0;
            node.rtt = Some(match node.rtt {
                Some(old) => (old * 7 + rtt) / 8,
                None => rtt,
            });
            // An address change for a known id is suspect; keep the old
            // endpoint.
            return false;
        }

        let entry = NodeEntry {
            id,
            addr,
            last_seen: Instant::now(),
            rtt: Some(rtt),
            confirmed: true,
            fail_count: 0,
        };
        self.insert(entry)
    }

    // A node was mentioned in a reply but hasn't answered us itself.
    pub fn heard_about(&mut self, id: NodeId, addr: SocketAddr) -> bool {
        if id == self.own_id {
            return false;
        }
        let idx = self.bucket_index(&id);
        if self.buckets[idx].nodes.iter().any(|n| n.id == id) {
            return false;
        }
        self.insert(NodeEntry {
            id,
            addr,
            last_seen: Instant::now(),
            rtt: None,
            confirmed: false,
            fail_count: 0,
        })
    }

    fn insert(&mut self, entry: NodeEntry) -> bool {
        let idx = self.bucket_index(&entry.id);
        let bucket = &mut self.buckets[idx];

        if bucket.nodes.len() < BUCKET_SIZE {
            bucket.nodes.push(entry);
            return true;
        }

        // Full bucket: split if it is the one our own id falls in,
        // otherwise try to displace an unconfirmed or failed node,
        // otherwise stash as a replacement.
        if idx == self.buckets.len() - 1 && self.buckets.len() < 160 {
            self.split();
            return self.insert(entry);
        }

        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket
            .nodes
            .iter()
            .position(|n| !n.confirmed || n.fail_count >= MAX_FAIL_COUNT)
        {
            if entry.confirmed {
                bucket.nodes[pos] = entry;
                return true;
            }
        }

        if bucket.replacements.len() >= BUCKET_SIZE {
            bucket.replacements.remove(0);
        }
        bucket.replacements.push(entry);
        false
    }

    // Move nodes with a longer shared prefix into a fresh deeper bucket.
    fn split(&mut self) {
        let last = self.buckets.len() - 1;
        let split_bits = self.buckets.len();
        let mut deeper = Bucket::new();

        let bucket = &mut self.buckets[last];
        let mut i = 0;
        while i < bucket.nodes.len() {
            if self.own_id.common_prefix_bits(&bucket.nodes[i].id) >= split_bits {
                deeper.nodes.push(bucket.nodes.remove(i));
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < bucket.replacements.len() {
            if self.own_id.common_prefix_bits(&bucket.replacements[i].id) >= split_bits {
                deeper.replacements.push(bucket.replacements.remove(i));
            } else {
                i += 1;
            }
        }

        self.buckets.push(deeper);
    }

    // A query to the node failed; evict after enough strikes, promoting
    // a replacement.
    pub fn node_failed(&mut self, id: NodeId) {
        let idx = self.bucket_index(&id);
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.nodes.iter().position(|n| n.id == id) else {
            return;
        };
        bucket.nodes[pos].fail_count += 1;
        if bucket.nodes[pos].fail_count >= MAX_FAIL_COUNT {
            bucket.nodes.remove(pos);
            if let Some(replacement) = bucket.replacements.pop() {
                bucket.nodes.push(replacement);
            }
        }
    }

    // The k nodes closest to target, by XOR distance.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeEntry> {
        let mut nodes: Vec<NodeEntry> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter().copied())
            .collect();
        nodes.sort_by_key(|n| n.id.distance(target));
        nodes.truncate(count);
        nodes
    }

    // Refresh targets for buckets that have gone quiet.
    pub fn refresh_targets(&mut self, now: Instant) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for (i, bucket) in self.buckets.iter_mut().enumerate() {
            if now.duration_since(bucket.last_changed) >= REFRESH_INTERVAL {
                bucket.last_changed = now;
                targets.push(self.own_id.random_with_prefix(i));
            }
        }
        targets
    }

    // Snapshot for persistence across restarts.
    pub fn export(&self) -> Vec<NodeEntry> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter().copied())
            .filter(|n| n.confirmed)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u16) -> SocketAddr {
        format!("10.0.{}.{}:6881", n / 256, n % 256).parse().unwrap()
    }

    fn id_with_prefix(own: &NodeId, bits: usize, salt: u8) -> NodeId {
        let mut id = own.random_with_prefix(bits);
        id.0[19] = salt;
        id
    }

    #[test]
    fn test_node_seen_inserts_and_updates() {
        let own = NodeId([0; 20]);
        let mut table = RoutingTable::new(own);
        let id = NodeId([0xff; 20]);

        assert!(table.node_seen(id, addr(1), Duration::from_millis(50)));
        assert_eq!(table.num_nodes(), 1);
        // Seen again: update, no new node.
        assert!(!table.node_seen(id, addr(1), Duration::from_millis(70)));
        assert_eq!(table.num_nodes(), 1);
        // Own id is never inserted.
        assert!(!table.node_seen(own, addr(2), Duration::from_millis(10)));
    }

    #[test]
    fn test_bucket_splits_on_own_side() {
        let own = NodeId([0; 20]);
        let mut table = RoutingTable::new(own);

        // Nodes at a spread of depths; the own-id bucket keeps
        // splitting to make room.
        for i in 0..32u8 {
            let id = id_with_prefix(&own, (i % 8) as usize, i);
            table.node_seen(id, addr(i as u16), Duration::from_millis(20));
        }
        assert!(table.num_buckets() > 1);
        assert!(table.num_nodes() > BUCKET_SIZE);
    }

    #[test]
    fn test_far_bucket_does_not_grow_past_k() {
        let own = NodeId([0; 20]);
        let mut table = RoutingTable::new(own);

        // First split once so bucket 0 is no longer the deepest.
        for i in 0..16u8 {
            let id = id_with_prefix(&own, 4, i);
            table.node_seen(id, addr(100 + i as u16), Duration::from_millis(20));
        }
        let buckets_before = table.num_buckets();
        assert!(buckets_before > 1);

        // Nodes with no shared prefix all land in bucket 0, capped at k.
        let mut far_inserted = 0;
        for i in 0..20u8 {
            let mut raw = [0xffu8; 20];
            raw[19] = i;
            if table.node_seen(NodeId(raw), addr(i as u16), Duration::from_millis(20)) {
                far_inserted += 1;
            }
        }
        assert!(far_inserted <= BUCKET_SIZE);
    }

    #[test]
    fn test_failed_node_evicted_for_replacement() {
        let own = NodeId([0; 20]);
        let mut table = RoutingTable::new(own);

        // A full far bucket plus one replacement candidate.
        let mut ids = Vec::new();
        for i in 0..BUCKET_SIZE as u8 {
            let mut raw = [0x80u8; 20];
            raw[19] = i;
            let id = NodeId(raw);
            // Pad the table so the far bucket can't split.
            table.node_seen(id_with_prefix(&own, 4, i), addr(200 + i as u16), Duration::from_millis(5));
            table.node_seen(id, addr(i as u16), Duration::from_millis(5));
            ids.push(id);
        }
        let mut raw = [0x80u8; 20];
        raw[19] = 0xfe;
        let replacement = NodeId(raw);
        table.heard_about(replacement, addr(999));

        let victim = ids[0];
        for _ in 0..3 {
            table.node_failed(victim);
        }
        let closest = table.closest(&victim, 64);
        assert!(!closest.iter().any(|n| n.id == victim));
        assert!(closest.iter().any(|n| n.id == replacement));
    }

    #[test]
    fn test_closest_orders_by_distance() {
        let own = NodeId([0; 20]);
        let mut table = RoutingTable::new(own);
        let target = NodeId([0x0f; 20]);

        for i in 1..=16u8 {
            let mut raw = [0u8; 20];
            raw[0] = i;
            table.node_seen(NodeId(raw), addr(i as u16), Duration::from_millis(5));
        }

        let closest = table.closest(&target, 4);
        assert_eq!(closest.len(), 4);
        for pair in closest.windows(2) {
            assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
        }
    }

    #[test]
    fn test_refresh_targets_for_stale_buckets() {
        let own = NodeId([0; 20]);
        let mut table = RoutingTable::new(own);
        table.node_seen(NodeId([0xff; 20]), addr(1), Duration::from_millis(5));

        assert!(table.refresh_targets(Instant::now()).is_empty());
        let later = Instant::now() + REFRESH_INTERVAL + Duration::from_secs(1);
        let targets = table.refresh_targets(later);
        assert_eq!(targets.len(), 1);
        // And only once per interval.
        assert!(table.refresh_targets(later).is_empty());
    }
}
