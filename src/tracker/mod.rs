use std::{net::SocketAddr, sync::Arc, time::Instant};
use rand::seq::SliceRandom;
use url::Url;
use crate::{storage::Resolver, ID};

mod http;
mod udp;
pub use http::HttpTracker;
pub use udp::UdpTracker;

pub type Result<T> = std::result::Result<T, TrackerError>;

// In cases where the tracker doesn't give us an interval.
const DEFAULT_ANNOUNCE_INTERVAL: u64 = 1800; // seconds
const DEFAULT_MIN_ANNOUNCE_INTERVAL: u64 = 60; // seconds

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(String),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("response error: {0}")]
    ResponseError(String),

    // The tracker said why it refused us.
    #[error("tracker failure: {0}")]
    Failure(String),

}

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum Event {

    Completed,

    #[default]
    Started,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct AnnounceParams {

    // Hash of info dict.
    pub info_hash: ID,

    // Urlencoded 20-byte string used as a unique ID for the client.
    pub client_id: ID,

    // Port number the client listens on.
    pub port: u16,

    // The total amount uploaded since the started event.
    pub uploaded: u64,

    // The total amount downloaded since the started event.
    pub downloaded: u64,

    // The number of bytes this client still has to download.
    pub left: u64,

    // If not specified, the request is one performed at regular intervals.
    pub event: Option<Event>,

    // Number of peers that the client would like to receive from the tracker.
    pub num_want: Option<usize>,

    // Random key identifying this client across IP changes.
    pub key: u32,

}

#[derive(Debug, Default)]
pub struct AnnounceResponse {

    pub peers: Vec<SocketAddr>,

    pub interval: Option<u64>,

    pub min_interval: Option<u64>,

    pub complete: Option<u64>,

    pub incomplete: Option<u64>,

}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScrapeEntry {

    pub complete: u32,

    pub downloaded: u32,

    pub incomplete: u32,

}

#[async_trait::async_trait]
pub trait Tracker: Send + Sync {

    async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse>;

    fn url(&self) -> &Url;

    // Whether the min interval allows an announce now (we want peers).
    fn can_announce(&self, time: Instant) -> bool;

    // Whether the regular interval asks for an announce now.
    fn should_announce(&self, time: Instant) -> bool;

}

pub fn create_tracker(url: Url, resolver: Option<Arc<dyn Resolver>>) -> Result<Box<dyn Tracker>> {
    match url.scheme() {
        "http" | "https" => Ok(Box::new(HttpTracker::new(url, resolver))),
        "udp" => Ok(Box::new(UdpTracker::new(url, resolver))),
        other => Err(TrackerError::UnsupportedScheme(other.to_string())),
    }
}

pub struct AnnounceOutcome {

    pub peers: Vec<SocketAddr>,

    // (url, peer count) per successful announce.
    pub replies: Vec<(Url, usize)>,

    pub errors: Vec<(Url, String)>,

}

// Trackers grouped in ordered tiers. Within a tier the order is shuffled
// once at install; a successful tracker moves to the front of its tier
// so it is tried first next time.
pub struct TrackerSet {

    tiers: Vec<Vec<Box<dyn Tracker>>>,

    pub announce_to_all_tiers: bool,

    pub announce_to_all_trackers: bool,

}

impl TrackerSet {

    pub fn new(
        urls: Vec<Vec<Url>>,
        all_tiers: bool,
        all_trackers: bool,
        resolver: Option<Arc<dyn Resolver>>,
    ) -> Self {
        let mut tiers = Vec::new();
        for tier_urls in urls {
            let mut tier: Vec<Box<dyn Tracker>> = tier_urls
                .into_iter()
                .filter_map(|url| match create_tracker(url.clone(), resolver.clone()) {
                    Ok(tracker) => Some(tracker),
                    Err(e) => {
                        tracing::warn!("skipping tracker {}: {}", url, e);
                        None
                    }
                })
                .collect();
            tier.shuffle(&mut rand::thread_rng());
            if !tier.is_empty() {
                tiers.push(tier);
            }
        }
        Self {
            tiers,
            announce_to_all_tiers: all_tiers,
            announce_to_all_trackers: all_trackers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    // Whether any tracker wants an announce at `time`.
    pub fn announce_due(&self, time: Instant) -> bool {
        self.tiers
            .iter()
            .flatten()
            .any(|t| t.should_announce(time))
    }

    // Walk the tiers in order. By default the walk stops at the first
    // tracker that answers; the all-tiers/all-trackers settings widen it.
    pub async fn announce(&mut self, params: AnnounceParams, time: Instant) -> AnnounceOutcome {

        let mut outcome = AnnounceOutcome {
            peers: Vec::new(),
            replies: Vec::new(),
            errors: Vec::new(),
        };

        'tiers: for tier in self.tiers.iter_mut() {
            let mut success_at: Option<usize> = None;

            for (i, tracker) in tier.iter_mut().enumerate() {
                if params.event.is_none() && !tracker.can_announce(time) {
                    continue;
                }

                match tracker.announce(params).await {
                    Ok(resp) => {
                        outcome.replies.push((tracker.url().clone(), resp.peers.len()));
                        outcome.peers.extend(resp.peers);
                        success_at = Some(i);
                        if !self.announce_to_all_trackers {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("tracker {} announce error: {}", tracker.url(), e);
                        outcome.errors.push((tracker.url().clone(), e.to_string()));
                    }
                }
            }

            // Promote the responding tracker to the tier front.
            if let Some(i) = success_at {
                if i > 0 && !self.announce_to_all_trackers {
                    let tracker = tier.remove(i);
                    tier.insert(0, tracker);
                }
                if !self.announce_to_all_tiers {
                    break 'tiers;
                }
            }
        }

        outcome.peers.sort();
        outcome.peers.dedup();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct FakeTracker {
        url: Url,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Tracker for FakeTracker {

        async fn announce(&mut self, _params: AnnounceParams) -> Result<AnnounceResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TrackerError::ResponseError("down".into()))
            } else {
                Ok(AnnounceResponse {
                    peers: vec!["10.1.1.1:6881".parse().unwrap()],
                    ..Default::default()
                })
            }
        }

        fn url(&self) -> &Url {
            &self.url
        }

        fn can_announce(&self, _time: Instant) -> bool { true }

        fn should_announce(&self, _time: Instant) -> bool { true }
    }

    fn fake(name: &str, fail: bool, calls: &Arc<AtomicUsize>) -> Box<dyn Tracker> {
        Box::new(FakeTracker {
            url: Url::parse(&format!("http://{}/announce", name)).unwrap(),
            fail,
            calls: calls.clone(),
        })
    }

    #[tokio::test]
    async fn test_failed_tracker_falls_through_tier() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut set = TrackerSet {
            tiers: vec![vec![
                fake("bad.example", true, &calls),
                fake("good.example", false, &calls),
            ]],
            announce_to_all_tiers: false,
            announce_to_all_trackers: false,
        };

        let outcome = set.announce(AnnounceParams::default(), Instant::now()).await;
        assert_eq!(outcome.peers.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The good tracker was promoted to the tier front and answers
        // alone next time.
        assert_eq!(set.tiers[0][0].url().host_str(), Some("good.example"));
        let outcome = set.announce(AnnounceParams::default(), Instant::now()).await;
        assert!(outcome.errors.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_first_tier_success_stops_walk() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut set = TrackerSet {
            tiers: vec![
                vec![fake("tier1.example", false, &calls)],
                vec![fake("tier2.example", false, &calls)],
            ],
            announce_to_all_tiers: false,
            announce_to_all_trackers: false,
        };
        set.announce(AnnounceParams::default(), Instant::now()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_announce_to_all_tiers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut set = TrackerSet {
            tiers: vec![
                vec![fake("tier1.example", false, &calls)],
                vec![fake("tier2.example", false, &calls)],
            ],
            announce_to_all_tiers: true,
            announce_to_all_trackers: false,
        };
        set.announce(AnnounceParams::default(), Instant::now()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let url = Url::parse("wss://tracker.example/announce").unwrap();
        assert!(matches!(
            create_tracker(url, None),
            Err(TrackerError::UnsupportedScheme(_))
        ));
    }
}
