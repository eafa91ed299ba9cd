use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::{Duration, Instant},
};
use crate::ID;

// Quota is handed out in blocks. Large blocks are cheap to account but
// coarse; small blocks track a low throttle more closely. The hand-out
// is bounded either way.
const MAX_BANDWIDTH_BLOCK: usize = 33_000;
const MIN_BANDWIDTH_BLOCK: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

// Grants are forgotten after one second, freeing their quota.
const WINDOW: Duration = Duration::from_secs(1);

// One direction of a rate limit: the throttle, the quota currently out,
// and the history of grants still inside the window. Torrent channels
// draw from the session channel, so a grant has to fit both.
#[derive(Debug)]
pub struct Channel {

    // Bytes/s. None is unlimited.
    throttle: Option<usize>,

    // Sum of grants not yet expired.
    quota: usize,

    // Grant history, ordered by expiry.
    history: VecDeque<(Instant, usize)>,

}

impl Channel {

    pub fn new(throttle: Option<usize>) -> Self {
        Self {
            throttle,
            quota: 0,
            history: VecDeque::new(),
        }
    }

    pub fn throttle(&self) -> Option<usize> {
        self.throttle
    }

    // Quota still assignable right now.
    pub fn available(&self) -> Option<usize> {
        self.throttle.map(|limit| limit.saturating_sub(self.quota))
    }

    fn charge(&mut self, amount: usize, now: Instant) {
        if self.throttle.is_some() {
            self.quota += amount;
            self.history.push_back((now + WINDOW, amount));
        }
    }

    // Drop grants past the window. Returns the bytes freed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut freed = 0;
        while let Some(&(expires_at, amount)) = self.history.front() {
            if expires_at > now {
                break;
            }
            self.history.pop_front();
            freed += amount;
        }
        self.quota -= freed;
        freed
    }
}

// A queued ask for bandwidth.
#[derive(Debug, Clone, Copy)]
struct QueueEntry {

    consumer: SocketAddr,

    torrent: ID,

    // The most the consumer can use right now.
    max_block: usize,

    prioritized: bool,

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub consumer: SocketAddr,
    pub amount: usize,
}

// FIFO bandwidth queue over a channel. Dispatch walks the queue handing
// out blocks until the window quota runs dry; deferred entries keep
// their place for the next window.
#[derive(Debug)]
pub struct BandwidthLimiter {

    channel: Channel,

    queue: VecDeque<QueueEntry>,

    // Suppresses dispatch re-entered from within a dispatch.
    dispatching: bool,

}

impl BandwidthLimiter {

    pub fn new(throttle: Option<usize>) -> Self {
        Self {
            channel: Channel::new(throttle),
            queue: VecDeque::new(),
            dispatching: false,
        }
    }

    pub fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    pub fn is_queued(&self, consumer: SocketAddr) -> bool {
        self.queue.iter().any(|e| e.consumer == consumer)
    }

    // Queue a request. Non-prioritized requests wait at the tail;
    // prioritized ones bubble forward past non-prioritized entries of
    // the same torrent. Entries of other torrents keep their order.
    pub fn request(&mut self, consumer: SocketAddr, torrent: ID, max_block: usize, prioritized: bool) {
        debug_assert!(max_block > 0);
        debug_assert!(!self.is_queued(consumer));

        self.queue.push_back(QueueEntry {
            consumer,
            torrent,
            max_block,
            prioritized,
        });
        if !prioritized {
            return;
        }

        let mut i = self.queue.len() - 1;
        for j in (0..self.queue.len() - 1).rev() {
            if self.queue[j].torrent != torrent {
                continue;
            }
            if self.queue[j].prioritized {
                break;
            }
            self.queue.swap(i, j);
            i = j;
        }
    }

    // Drop a consumer that is disconnecting; its turn is forfeited.
    pub fn forfeit(&mut self, consumer: SocketAddr) {
        self.queue.retain(|e| e.consumer != consumer);
    }

    // Expire the window and hand out what the expiry freed.
    pub fn tick(&mut self, now: Instant, parent: Option<&mut Channel>) -> Vec<Grant> {
        self.channel.expire(now);
        if let Some(parent) = parent {
            parent.expire(now);
            self.dispatch(now, Some(parent))
        } else {
            self.dispatch(now, None)
        }
    }

    // Hand out bandwidth to queued consumers, in order. An entry whose
    // turn arrives when less than half its block is available is
    // deferred rather than short-changed.
    pub fn dispatch(&mut self, now: Instant, mut parent: Option<&mut Channel>) -> Vec<Grant> {
        if self.dispatching {
            return Vec::new();
        }
        self.dispatching = true;

        let mut grants = Vec::new();
        let mut deferred: VecDeque<QueueEntry> = VecDeque::new();

        while let Some(entry) = self.queue.pop_front() {

            let available = match (
                self.channel.available(),
                parent.as_ref().and_then(|p| p.available()),
            ) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(usize::MAX).min(b.unwrap_or(usize::MAX))),
            };

            let limit = match (self.channel.throttle(), parent.as_ref().and_then(|p| p.throttle())) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(usize::MAX).min(b.unwrap_or(usize::MAX))),
            };

            let block_size = match limit {
                None => MAX_BANDWIDTH_BLOCK,
                Some(limit) => {
                    let mut block = limit / 10;
                    if block < MIN_BANDWIDTH_BLOCK {
                        block = MIN_BANDWIDTH_BLOCK.min(limit.max(1));
                    } else if block > MAX_BANDWIDTH_BLOCK {
                        // A divisor of the limit splits the window fairly.
                        block = limit / (limit / MAX_BANDWIDTH_BLOCK);
                    }
                    block
                }
            };
            let block_size = block_size.min(entry.max_block);

            match available {
                None => {
                    // Unlimited: everyone gets a full block.
                    grants.push(Grant { consumer: entry.consumer, amount: block_size });
                }
                Some(available) => {
                    if available < block_size / 2 || available == 0 {
                        // Out of quota this window.
                        deferred.push_back(entry);
                        break;
                    }
                    let amount = block_size.min(available);
                    self.channel.charge(amount, now);
                    if let Some(parent) = parent.as_deref_mut() {
                        parent.charge(amount, now);
                    }
                    grants.push(Grant { consumer: entry.consumer, amount });
                }
            }
        }

        // Deferred entries go back in front of anything queued meanwhile.
        while let Some(entry) = deferred.pop_back() {
            self.queue.push_front(entry);
        }

        self.dispatching = false;
        grants
    }
}
