use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
};
use super::node_id::NodeId;

// Result set cap; nodes farther than the hundredth are not worth
// chasing.
pub const MAX_RESULTS: usize = 100;

pub const DEFAULT_BRANCH_FACTOR: usize = 3;

// Lookups aim for this many confirmed-closest nodes.
pub const TARGET_NODES: usize = 8;

#[derive(Debug, Default, Clone, Copy)]
pub struct CandidateFlags {

    pub queried: bool,

    pub alive: bool,

    pub failed: bool,

    pub short_timeout: bool,

    // Seeded router/bootstrap node; exempt from the IP restriction and
    // carries no usable id.
    pub initial: bool,

    pub no_id: bool,

}

#[derive(Debug, Clone, Copy)]
pub struct Candidate {

    pub id: NodeId,

    pub addr: SocketAddr,

    pub flags: CandidateFlags,

}

impl Candidate {
    fn in_flight(&self) -> bool {
        self.flags.queried && !self.flags.alive && !self.flags.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalKind {

    // Lookup of the k closest nodes to an id.
    FindNode,

    // Lookup of peers for an infohash; collects values and write tokens.
    GetPeers,

}

// One iterative Kademlia lookup. The DHT node drives it: it asks for the
// next endpoints to query, sends the RPCs, and feeds replies and
// timeouts back in.
#[derive(Debug)]
pub struct Traversal {

    pub id: u32,

    pub kind: TraversalKind,

    target: NodeId,

    // Kept sorted by XOR distance to the target.
    results: Vec<Candidate>,

    branch_factor: usize,

    // Aggressive mode keeps branch_factor outstanding at the top of the
    // list rather than in total.
    aggressive: bool,

    restrict_ips: bool,

    // Queries in flight.
    invoke_count: usize,

    responses_alive: usize,

    // Lookup is satisfied with this many live responses; zeroed on
    // abort.
    num_target_nodes: usize,

    done: bool,

    // get_peers yield.
    peers: Vec<SocketAddr>,

    tokens: HashMap<SocketAddr, Vec<u8>>,

}

impl Traversal {

    pub fn new(
        id: u32,
        target: NodeId,
        kind: TraversalKind,
        aggressive: bool,
        restrict_ips: bool,
    ) -> Self {
        Self {
            id,
            kind,
            target,
            results: Vec::new(),
            branch_factor: DEFAULT_BRANCH_FACTOR,
            aggressive,
            restrict_ips,
            invoke_count: 0,
            responses_alive: 0,
            num_target_nodes: TARGET_NODES,
            done: false,
            peers: Vec::new(),
            tokens: HashMap::new(),
        }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn branch_factor(&self) -> usize {
        self.branch_factor
    }

    pub fn outstanding(&self) -> usize {
        self.invoke_count
    }

    pub fn num_short_timeouts(&self) -> usize {
        self.results.iter().filter(|c| c.flags.short_timeout && c.in_flight()).count()
    }

    // Seed from the routing table's closest nodes; fall back on routers
    // when the table is too empty to start.
    pub fn seed(&mut self, nodes: &[(NodeId, SocketAddr)], routers: &[SocketAddr]) {
        for (id, addr) in nodes {
            self.add_entry(Some(*id), *addr, false);
        }
        if self.results.len() < 3 {
            for addr in routers {
                self.add_entry(None, *addr, true);
            }
        }
    }

    // Admit a candidate. Rejections: duplicate endpoint or id, and (when
    // the restriction is on) an IP too close to one already admitted,
    // which starves Sybil swarms squatting a prefix.
    pub fn add_entry(&mut self, id: Option<NodeId>, addr: SocketAddr, initial: bool) -> bool {
        if self.done {
            return false;
        }
        if self.results.iter().any(|c| c.addr == addr) {
            return false;
        }
        if let Some(id) = id {
            if self.results.iter().any(|c| !c.flags.no_id && c.id == id) {
                return false;
            }
        }
        if self.restrict_ips
            && !initial
            && self.results.iter().any(|c| same_prefix(&c.addr.ip(), &addr.ip()))
        {
            tracing::trace!("rejecting {} against prefix already in result set", addr);
            return false;
        }

        let flags = CandidateFlags {
            initial,
            no_id: id.is_none(),
            ..Default::default()
        };
        let candidate = Candidate {
            // Routers sort to the far end until they reveal an id.
            id: id.unwrap_or(NodeId([0xff; 20])),
            addr,
            flags,
        };

        let dist = candidate.id.distance(&self.target);
        let pos = self
            .results
            .partition_point(|c| c.id.distance(&self.target) <= dist);
        self.results.insert(pos, candidate);

        if self.results.len() > MAX_RESULTS {
            // Drop the farthest candidate that isn't in flight.
            if let Some(pos) = self.results.iter().rposition(|c| !c.in_flight()) {
                self.results.remove(pos);
            }
        }
        true
    }

    // Endpoints to query next, within the branch factor. Marks them
    // queried; the caller owns actually sending the RPCs.
    pub fn next_queries(&mut self) -> Vec<(SocketAddr, Option<NodeId>)> {
        if self.done || self.num_target_nodes == 0 {
            return Vec::new();
        }

        let mut picked = Vec::new();
        let mut outstanding_above = 0;

        for candidate in self.results.iter_mut() {
            if candidate.flags.failed || candidate.flags.alive {
                continue;
            }
            if candidate.flags.queried {
                outstanding_above += 1;
                continue;
            }

            let within_branch = if self.aggressive {
                outstanding_above < self.branch_factor
            } else {
                self.invoke_count < self.branch_factor
            };
            if !within_branch {
                break;
            }

            candidate.flags.queried = true;
            self.invoke_count += 1;
            outstanding_above += 1;
            picked.push((
                candidate.addr,
                (!candidate.flags.no_id).then_some(candidate.id),
            ));
        }

        picked
    }

    // A queried node answered. Returns the nodes to fold into the
    // routing table.
    pub fn finished(&mut self, addr: SocketAddr, id: NodeId) {
        let Some(candidate) = self.results.iter_mut().find(|c| c.addr == addr) else {
            return;
        };
        if !candidate.flags.queried || candidate.flags.alive {
            return;
        }
        candidate.flags.alive = true;
        let was_short = candidate.flags.short_timeout;
        let learned_id = candidate.flags.no_id;
        if learned_id {
            candidate.flags.no_id = false;
            candidate.id = id;
        }
        if learned_id {
            self.resort();
        }
        // A short-timeout bump is paid back when the reply lands.
        if was_short && self.branch_factor > DEFAULT_BRANCH_FACTOR {
            self.branch_factor -= 1;
        }
        self.invoke_count = self.invoke_count.saturating_sub(1);
        self.responses_alive += 1;
    }

    // A queried node blew its short deadline: widen the branch factor so
    // new candidates can be tried while the late reply stays welcome.
    pub fn short_timeout(&mut self, addr: SocketAddr) {
        let Some(candidate) = self.results.iter_mut().find(|c| c.addr == addr) else {
            return;
        };
        if candidate.flags.short_timeout || !candidate.in_flight() {
            return;
        }
        candidate.flags.short_timeout = true;
        self.branch_factor += 1;
    }

    // A queried node is gone for good.
    pub fn failed(&mut self, addr: SocketAddr) {
        let Some(candidate) = self.results.iter_mut().find(|c| c.addr == addr) else {
            return;
        };
        if !candidate.in_flight() {
            return;
        }
        let was_short = candidate.flags.short_timeout;
        candidate.flags.failed = true;
        if was_short && self.branch_factor > DEFAULT_BRANCH_FACTOR {
            self.branch_factor -= 1;
        }
        self.invoke_count = self.invoke_count.saturating_sub(1);
    }

    pub fn add_peers(&mut self, peers: impl IntoIterator<Item = SocketAddr>) {
        self.peers.extend(peers);
        self.peers.sort();
        self.peers.dedup();
    }

    pub fn add_token(&mut self, addr: SocketAddr, token: Vec<u8>) {
        self.tokens.insert(addr, token);
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    pub fn token_for(&self, addr: &SocketAddr) -> Option<&Vec<u8>> {
        self.tokens.get(addr)
    }

    fn resort(&mut self) {
        let target = self.target;
        self.results.sort_by_key(|c| c.id.distance(&target));
    }

    pub fn abort(&mut self) {
        self.num_target_nodes = 0;
    }

    // Completion: enough live responses and nothing in flight, or the
    // candidate pool ran dry.
    pub fn check_done(&mut self) -> bool {
        if self.done {
            return true;
        }
        if self.invoke_count == 0 {
            let satisfied = self.responses_alive >= self.num_target_nodes;
            let exhausted = !self
                .results
                .iter()
                .any(|c| !c.flags.queried && !c.flags.failed);
            if satisfied || exhausted || self.num_target_nodes == 0 {
                self.done = true;
            }
        }
        self.done
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    // The k closest nodes that answered.
    pub fn closest_alive(&self) -> Vec<(NodeId, SocketAddr)> {
        self.results
            .iter()
            .filter(|c| c.flags.alive)
            .take(TARGET_NODES)
            .map(|c| (c.id, c.addr))
            .collect()
    }
}

// High-bit neighborhood comparison: /4 for v4, /64 for v6.
fn same_prefix(a: &IpAddr, b: &IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[0] >> 4 == b.octets()[0] >> 4,
        (IpAddr::V6(a), IpAddr::V6(b)) => a.octets()[..8] == b.octets()[..8],
        _ => false,
    }
}
