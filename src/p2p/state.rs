use std::time::{Duration, Instant};
use crate::stats::ThroughputStats;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Connecting,
    Handshaking,
    Introducing, // Where peers tell each other what pieces they have.
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are answering the peer's requests.
    pub choked: bool,

    // Whether we are interested in the peer's pieces.
    pub interested: bool,

    // Whether the peer is answering our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

    // A peer that contributed to a failed piece re-earns trust by
    // completing pieces on its own before it may share again. The
    // trust score itself lives with the torrent controller.
    pub on_parole: bool,

    // Request timeouts in a row. At the snub threshold the peer is
    // limited to one outstanding request.
    pub consecutive_timeouts: u32,

    pub snubbed: bool,

    // Smoothed request round-trip estimate.
    pub rtt: Duration,

    pub throughput: ThroughputStats,

    pub num_pieces: usize,

    pub connect_time: Option<Instant>,

    pub last_unchoked: Option<Instant>,

    // Bytes uploaded to the peer since it was last unchoked.
    pub uploaded_since_unchoke: u64,

    pub changed: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            on_parole: false,
            consecutive_timeouts: 0,
            snubbed: false,
            rtt: Duration::from_secs(2),
            throughput: ThroughputStats::default(),
            num_pieces: 0,
            connect_time: None,
            last_unchoked: None,
            uploaded_since_unchoke: 0,
            changed: false,
        }
    }
}

impl SessionState {

    pub fn tick(&mut self) {
        self.throughput.reset();
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }

    // New rtt samples fold into the estimate at 1/8 weight.
    pub fn record_rtt(&mut self, sample: Duration) {
        self.rtt = (self.rtt * 7 + sample) / 8;
        self.consecutive_timeouts = 0;
        self.snubbed = false;
    }

    pub fn record_request_timeout(&mut self, snub_threshold: u32) {
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= snub_threshold {
            self.snubbed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snub_after_consecutive_timeouts() {
        let mut state = SessionState::default();
        state.record_request_timeout(3);
        state.record_request_timeout(3);
        assert!(!state.snubbed);
        state.record_request_timeout(3);
        assert!(state.snubbed);
        // A successful round trip clears the snub.
        state.record_rtt(Duration::from_millis(80));
        assert!(!state.snubbed);
        assert_eq!(state.consecutive_timeouts, 0);
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut state = SessionState::default();
        let start = state.rtt;
        state.record_rtt(Duration::from_millis(100));
        assert!(state.rtt < start);
        for _ in 0..50 {
            state.record_rtt(Duration::from_millis(100));
        }
        let ms = state.rtt.as_millis();
        assert!((95..=105).contains(&ms));
    }
}
