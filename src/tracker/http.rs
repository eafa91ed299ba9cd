use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use crate::storage::Resolver;
use super::{
    AnnounceParams, AnnounceResponse, Result, Tracker, TrackerError,
    DEFAULT_ANNOUNCE_INTERVAL, DEFAULT_MIN_ANNOUNCE_INTERVAL,
};

// Overall announce deadline and fingerprinted user agent.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("swarm/", env!("CARGO_PKG_VERSION"), " LT-0100-");
const MAX_REDIRECTS: usize = 5;

pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

    // A string the tracker asked us to echo on the next announce.
    id: Option<String>,

    last_announce: Option<Instant>,

    interval: Option<Duration>,

    min_interval: Option<Duration>,

}

// Adapts the engine's resolver collaborator to the http client's DNS
// hook.
struct ResolverBridge(Arc<dyn Resolver>);

impl reqwest::dns::Resolve for ResolverBridge {
    fn resolve(&self, name: hyper::client::connect::dns::Name) -> reqwest::dns::Resolving {
        let resolver = self.0.clone();
        Box::pin(async move {
            let ips = resolver.resolve(name.as_str(), false).await?;
            let addrs: reqwest::dns::Addrs =
                Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

impl HttpTracker {
    pub fn new(url: Url, resolver: Option<Arc<dyn Resolver>>) -> Self {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(COMPLETION_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .gzip(true);
        if let Some(resolver) = resolver {
            builder = builder.dns_resolver(Arc::new(ResolverBridge(resolver)));
        }
        let client = builder
            .build()
            .expect("http client construction cannot fail with static options");
        Self {
            client,
            url,
            id: None,
            last_announce: None,
            interval: None,
            min_interval: None,
        }
    }
}

// The raw 20-byte values go percent-encoded straight into the query
// string; reqwest's form encoding would mangle them.
fn build_announce_url(base: &Url, params: &AnnounceParams, tracker_id: Option<&str>) -> String {
    let mut url = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&key={:08x}&compact=1",
        base.as_str(),
        urlencoding::encode_binary(&params.info_hash),
        urlencoding::encode_binary(&params.client_id),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
        params.key,
    );
    if let Some(event) = params.event {
        url.push_str(&format!("&event={}", event));
    }
    if let Some(num_want) = params.num_want {
        url.push_str(&format!("&numwant={}", num_want));
    }
    if let Some(tracker_id) = tracker_id {
        url.push_str(&format!("&trackerid={}", tracker_id));
    }
    url
}

#[async_trait::async_trait]
impl Tracker for HttpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse> {

        let url = build_announce_url(&self.url, &params, self.id.as_deref());
        tracing::debug!("announce url: {}", url);

        let raw_resp = self.client
            .get(url)
            .send()
            .await?
            .bytes()
            .await?;

        let resp: HttpResponse = serde_bencode::from_bytes(&raw_resp)
            .map_err(|e| TrackerError::BencodeError(e.to_string()))?;
        tracing::trace!("announce response: {:?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::Failure(failure));
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }

        if let Some(interval) = resp.interval {
            self.interval = Some(Duration::from_secs(interval));
        }
        if let Some(min_interval) = resp.min_interval {
            self.min_interval = Some(Duration::from_secs(min_interval));
        }
        if let Some(tracker_id) = resp.tracker_id {
            self.id = Some(tracker_id);
        }

        self.last_announce = Some(Instant::now());

        let mut peers = resp.peers;
        peers.extend(resp.peers6);
        Ok(AnnounceResponse {
            peers,
            interval: resp.interval,
            min_interval: resp.min_interval,
            complete: resp.complete,
            incomplete: resp.incomplete,
        })
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn can_announce(&self, time: Instant) -> bool {
        if let Some(last_announce) = self.last_announce {
            time.duration_since(last_announce)
                >= self.min_interval.unwrap_or(Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL))
        } else {
            true
        }
    }

    fn should_announce(&self, time: Instant) -> bool {
        if let Some(last_announce) = self.last_announce {
            time.duration_since(last_announce)
                >= self.interval.unwrap_or(Duration::from_secs(DEFAULT_ANNOUNCE_INTERVAL))
        } else {
            true
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct HttpResponse {

    // If present, then no other keys may be present.
    // The value is a human-readable error message as to why the request failed.
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,

    // Similar to failure reason, but the response still gets processed.
    #[serde(rename = "warning message")]
    warning_message: Option<String>,

    // Interval in seconds that the client should wait between regular requests.
    interval: Option<u64>,

    // If present clients must not reannounce more frequently than this.
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,

    // A string that the client should send back on its next announcements.
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,

    // Number of peers with the entire file, i.e. seeders.
    complete: Option<u64>,

    // Number of non-seeder peers, aka "leechers".
    incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peers_v4_deserialize")]
    peers: Vec<SocketAddr>,

    // 18 bytes per peer: ip6 + port.
    #[serde(default)]
    #[serde(rename = "peers6")]
    #[serde(deserialize_with = "peers_v6_deserialize")]
    peers6: Vec<SocketAddr>,

}

// The tracker can either return a dictionary model or a compacted string.
// This is based on the value of the "compact" parameter.
// However, even if we request a compacted string, the tracker can still
// return a dictionary model.
fn peers_v4_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of bytes or a list of dictionaries")
        }

        // String model.
        // The first 4 bytes are the IP address and the last 2 bytes are
        // the port number, all in network byte order.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not multiple of 6"));
            }

            let num_peers = v.len() / 6;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ))
            }

            Ok(peers)
        }

        // Dictionary model.
        // A list of dictionaries, each with the keys "ip" and "port".
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    Err(_) => continue,
                };
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

fn peers_v6_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of 18-byte entries")
        }

        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 18 != 0 {
                return Err(E::custom("peer6 string not multiple of 18"));
            }

            let num_peers = v.len() / 18;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                let mut ip = [0u8; 16];
                v.copy_to_slice(&mut ip);
                peers.push(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(ip)),
                    v.get_u16(),
                ))
            }

            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_url_contains_required_params() {
        let url = Url::parse("http://test.com/announce").unwrap();
        let params = AnnounceParams {
            info_hash: [0xff; 20],
            client_id: *b"-SW0100-012345678901",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1024,
            event: Some(super::super::Event::Started),
            num_want: Some(50),
            key: 0xabcd1234,
        };
        let built = build_announce_url(&url, &params, None);
        assert!(built.starts_with("http://test.com/announce?info_hash=%FF%FF"));
        assert!(built.contains("&port=6881"));
        assert!(built.contains("&uploaded=0"));
        assert!(built.contains("&downloaded=0"));
        assert!(built.contains("&left=1024"));
        assert!(built.contains("&event=started"));
        assert!(built.contains("&compact=1"));
        assert!(built.contains("&numwant=50"));
        assert!(built.contains("&key=abcd1234"));
        // Tracker id echoed once assigned.
        let with_id = build_announce_url(&url, &params, Some("xyz"));
        assert!(with_id.contains("&trackerid=xyz"));
    }

    #[test]
    fn test_parse_response_compact() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:completei9e10:incompletei1e8:intervali1800e12:min intervali900e5:peers6:");
        raw.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
        raw.extend_from_slice(b"e");

        let resp: HttpResponse = serde_bencode::from_bytes(&raw).unwrap();
        assert_eq!(resp.interval, Some(1800));
        assert_eq!(resp.min_interval, Some(900));
        assert_eq!(resp.complete, Some(9));
        assert_eq!(resp.incomplete, Some(1));
        assert_eq!(resp.peers, vec!["10.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_response_peers6() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:intervali1800e6:peers618:");
        let mut entry = [0u8; 18];
        entry[15] = 1; // ::1
        entry[16] = 0x1a;
        entry[17] = 0xe1;
        raw.extend_from_slice(&entry);
        raw.extend_from_slice(b"e");

        let resp: HttpResponse = serde_bencode::from_bytes(&raw).unwrap();
        assert_eq!(resp.peers6, vec!["[::1]:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_response_failure_reason() {
        let raw = b"d14:failure reason17:torrent not founde";
        let resp: HttpResponse = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(resp.failure_reason.as_deref(), Some("torrent not found"));
    }

    #[test]
    fn test_parse_response_dict_model() {
        let raw = b"d8:intervali60e5:peersld2:ip8:10.0.0.24:porti6882eeee";
        let resp: HttpResponse = serde_bencode::from_bytes(raw).unwrap();
        assert_eq!(resp.peers, vec!["10.0.0.2:6882".parse().unwrap()]);
    }
}
