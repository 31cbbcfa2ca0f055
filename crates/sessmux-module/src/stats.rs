//! Server counters.
//!
//! Relaxed atomics bumped from every thread; read as a `StatsSnapshot` by
//! the periodic report and by tests.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub accepted: AtomicU64,
    /// Connections refused for capacity (table full / pool exhausted).
    pub rejected: AtomicU64,
    pub closed: AtomicU64,
    pub frames_in: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub protocol_errors: AtomicU64,
    /// Events whose token no longer resolved.
    pub stale_events: AtomicU64,
    /// `send` calls refused (unknown session or send ceiling).
    pub send_refused: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            stale_events: self.stale_events.load(Ordering::Relaxed),
            send_refused: self.send_refused.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub closed: u64,
    pub frames_in: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub protocol_errors: u64,
    pub stale_events: u64,
    pub send_refused: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "accepts={} rejects={} closes={} frames={} bytes_in={} bytes_out={} proto_err={} stale={} send_refused={}",
            self.accepted,
            self.rejected,
            self.closed,
            self.frames_in,
            self.bytes_in,
            self.bytes_out,
            self.protocol_errors,
            self.stale_events,
            self.send_refused,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = Stats::new();
        Stats::bump(&stats.accepted);
        Stats::add(&stats.bytes_in, 42);
        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.bytes_in, 42);
        assert!(snap.to_string().contains("accepts=1"));
    }
}
