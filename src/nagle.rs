//! Nagle-style batching simulated in user space
//!
//! While enabled, sends on a TCP connection are appended to its send buffer
//! and written only when `packet_count` of them are waiting or the oldest has
//! waited `timeout`. Readiness arriving within `timeout` of the previous
//! service is latched and serviced later from the worker tick.

use std::time::{Duration, Instant};

use crate::poller::Ready;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NagleConfig {
    /// Queued sends that force a flush. 0 disables the count trigger.
    pub packet_count: u32,
    /// Quiet period before latched readiness and unsent data are serviced.
    pub timeout: Duration,
}

impl NagleConfig {
    pub const DISABLED: NagleConfig = NagleConfig { packet_count: 0, timeout: Duration::ZERO };

    pub fn new(packet_count: u32, timeout: Duration) -> Self {
        Self { packet_count, timeout }
    }

    pub fn is_enabled(&self) -> bool {
        self.packet_count > 0 || !self.timeout.is_zero()
    }
}

/// Per-connection batching state.
#[derive(Debug, Clone)]
pub struct NagleState {
    unsent: u32,
    /// When the oldest unsent send was queued.
    first_unsent: Instant,
    last_service: Instant,
    latched: Ready,
}

impl Default for NagleState {
    fn default() -> Self {
        let now = Instant::now();
        Self { unsent: 0, first_unsent: now, last_service: now, latched: Ready::EMPTY }
    }
}

impl NagleState {
    pub fn reset(&mut self, now: Instant) {
        self.unsent = 0;
        self.first_unsent = now;
        self.last_service = now;
        self.latched = Ready::EMPTY;
    }

    /// Records one send queued at `now`. Returns `true` when the batch is
    /// full and should be written immediately.
    pub fn on_queued(&mut self, cfg: &NagleConfig, now: Instant) -> bool {
        if self.unsent == 0 {
            self.first_unsent = now;
        }
        self.unsent = self.unsent.saturating_add(1);
        cfg.packet_count > 0 && self.unsent >= cfg.packet_count
    }

    pub fn unsent(&self) -> u32 {
        self.unsent
    }

    /// The batch went out.
    pub fn on_flushed(&mut self) {
        self.unsent = 0;
    }

    /// Readiness was serviced at `now`; the quiet period restarts.
    pub fn touch(&mut self, now: Instant) {
        self.last_service = now;
    }

    fn within_timeout(&self, cfg: &NagleConfig, now: Instant) -> bool {
        now.saturating_duration_since(self.last_service) < cfg.timeout
    }

    /// Latches `ready` if it arrived inside the quiet period. Returns `true`
    /// when the caller must not service it now.
    pub fn defer(&mut self, cfg: &NagleConfig, ready: Ready, now: Instant) -> bool {
        if !cfg.is_enabled() || !self.within_timeout(cfg, now) {
            return false;
        }
        self.latched |= ready;
        true
    }

    /// Takes the latched readiness once the quiet period is over.
    pub fn take_due(&mut self, cfg: &NagleConfig, now: Instant) -> Ready {
        if self.latched.is_empty() || self.within_timeout(cfg, now) {
            return Ready::EMPTY;
        }
        self.latched.take()
    }

    /// Whether queued sends should be written now: they have waited out the
    /// timeout, or batching was switched off. With a packet count but no
    /// timeout only the count releases them.
    pub fn flush_due(&self, cfg: &NagleConfig, now: Instant) -> bool {
        if self.unsent == 0 {
            return false;
        }
        if !cfg.is_enabled() {
            return true;
        }
        !cfg.timeout.is_zero() && now.saturating_duration_since(self.first_unsent) >= cfg.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_defers() {
        let cfg = NagleConfig::DISABLED;
        let mut state = NagleState::default();
        assert!(!cfg.is_enabled());
        assert!(!state.defer(&cfg, Ready::RECV, Instant::now()));
        assert!(!state.on_queued(&cfg, Instant::now()));
    }

    #[test]
    fn test_count_trigger() {
        let cfg = NagleConfig::new(10, Duration::from_secs(1));
        let mut state = NagleState::default();
        let now = Instant::now();
        for _ in 0..9 {
            assert!(!state.on_queued(&cfg, now));
        }
        assert!(state.on_queued(&cfg, now));
        state.on_flushed();
        assert_eq!(state.unsent(), 0);
    }

    #[test]
    fn test_latched_readiness_released_after_timeout() {
        let cfg = NagleConfig::new(0, Duration::from_millis(50));
        let start = Instant::now();
        let mut state = NagleState::default();
        state.reset(start);

        assert!(state.defer(&cfg, Ready::RECV, start + Duration::from_millis(10)));
        assert!(state.defer(&cfg, Ready::SEND, start + Duration::from_millis(20)));
        assert!(state.take_due(&cfg, start + Duration::from_millis(30)).is_empty());

        let due = state.take_due(&cfg, start + Duration::from_millis(60));
        assert_eq!(due, Ready::RECV | Ready::SEND);
        assert!(state.take_due(&cfg, start + Duration::from_millis(70)).is_empty());

        // outside the quiet period readiness is serviced directly
        assert!(!state.defer(&cfg, Ready::RECV, start + Duration::from_millis(80)));
    }

    #[test]
    fn test_timeout_flush() {
        let cfg = NagleConfig::new(100, Duration::from_millis(5));
        let start = Instant::now();
        let mut state = NagleState::default();
        state.reset(start);
        assert!(!state.flush_due(&cfg, start + Duration::from_millis(10)));
        // measured from the first queued send, not from the last service
        state.on_queued(&cfg, start + Duration::from_millis(20));
        state.on_queued(&cfg, start + Duration::from_millis(23));
        assert!(!state.flush_due(&cfg, start + Duration::from_millis(22)));
        assert!(state.flush_due(&cfg, start + Duration::from_millis(25)));
        state.on_flushed();
        assert!(!state.flush_due(&cfg, start + Duration::from_millis(40)));
    }

    #[test]
    fn test_count_only_never_flushes_on_time() {
        let cfg = NagleConfig::new(10, Duration::ZERO);
        let start = Instant::now();
        let mut state = NagleState::default();
        state.reset(start);
        for _ in 0..9 {
            assert!(!state.on_queued(&cfg, start));
        }
        assert!(!state.flush_due(&cfg, start + Duration::from_secs(60)));
        // switching batching off releases what was held back
        assert!(state.flush_due(&NagleConfig::DISABLED, start));
        assert!(state.on_queued(&cfg, start));
    }
}
