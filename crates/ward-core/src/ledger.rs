//! Ledger — per-sender blacklist and session statistics.
//!
//! One ledger exists per process and is handed to every connection
//! handler and to the envelope codec. All state sits behind a single
//! mutex and every operation is one update under that lock.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

/// Consecutive decrypt failures tolerated before a sender is ignored.
pub const BLACKLIST_THRESHOLD: u32 = 5;

/// Sender identity used for local (Unix socket) connections.
pub const LOCAL_SENDER: &str = "local";

/// Byte and session counters for one source address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    /// Connections accepted.
    pub accepted: u64,
    /// Requests that decoded successfully.
    pub validated: u64,
    /// Bytes sent.
    pub tx: u64,
    /// Bytes received.
    pub rx: u64,
}

/// Global session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionTotals {
    #[serde(flatten)]
    pub counters: SessionCounters,
    /// Connections currently open.
    pub alive: u64,
}

/// Outcome of recording a decrypt failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    /// Consecutive failures after this one.
    pub count: u32,
    /// `true` exactly once: when this failure crossed the threshold.
    pub crossed: bool,
}

/// Point-in-time copy of the statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub sessions: SessionTotals,
    pub clients: BTreeMap<String, SessionCounters>,
}

#[derive(Default)]
struct LedgerInner {
    blacklist: BTreeMap<String, u32>,
    clients: BTreeMap<String, SessionCounters>,
    totals: SessionTotals,
}

/// Process-wide blacklist and statistics.
pub struct Ledger {
    inner: Mutex<LedgerInner>,
    threshold: u32,
}

impl Ledger {
    pub fn new() -> Self {
        Self::with_threshold(BLACKLIST_THRESHOLD)
    }

    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            threshold,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    // ── Blacklist ──────────────────────────────────────────────

    /// Whether messages from `sender` must be dropped unread.
    pub fn is_blacklisted(&self, sender: &str) -> bool {
        let inner = self.inner.lock().expect("ledger lock");
        inner
            .blacklist
            .get(sender)
            .is_some_and(|count| *count > self.threshold)
    }

    /// Count a decrypt failure for `sender`.
    pub fn record_decrypt_failure(&self, sender: &str) -> FailureRecord {
        let mut inner = self.inner.lock().expect("ledger lock");
        let count = inner.blacklist.entry(sender.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        FailureRecord {
            count: *count,
            crossed: *count == self.threshold + 1,
        }
    }

    /// Forget failures for `sender` after a successful decrypt.
    pub fn record_decrypt_success(&self, sender: &str) {
        let mut inner = self.inner.lock().expect("ledger lock");
        if inner.blacklist.remove(sender).is_some() {
            debug!(%sender, "blacklist counter cleared");
        }
    }

    /// Failure count for `sender` (0 when unknown).
    pub fn failures(&self, sender: &str) -> u32 {
        let inner = self.inner.lock().expect("ledger lock");
        inner.blacklist.get(sender).copied().unwrap_or(0)
    }

    /// Copy of all failure counters.
    pub fn blacklist(&self) -> BTreeMap<String, u32> {
        self.inner.lock().expect("ledger lock").blacklist.clone()
    }

    /// Clear one sender, or everyone when `sender` is `None`.
    ///
    /// Returns the number of entries removed.
    pub fn clear_blacklist(&self, sender: Option<&str>) -> usize {
        let mut inner = self.inner.lock().expect("ledger lock");
        match sender {
            Some(s) => usize::from(inner.blacklist.remove(s).is_some()),
            None => {
                let n = inner.blacklist.len();
                inner.blacklist.clear();
                n
            }
        }
    }

    // ── Statistics ─────────────────────────────────────────────

    /// A connection from `source` was accepted.
    pub fn record_accepted(&self, source: &str) {
        let mut inner = self.inner.lock().expect("ledger lock");
        inner.clients.entry(source.to_string()).or_default().accepted += 1;
        inner.totals.counters.accepted += 1;
        inner.totals.alive += 1;
    }

    /// A connection from `source` was closed.
    pub fn record_closed(&self) {
        let mut inner = self.inner.lock().expect("ledger lock");
        inner.totals.alive = inner.totals.alive.saturating_sub(1);
    }

    /// A request from `source` decoded successfully.
    pub fn record_validated(&self, source: &str) {
        let mut inner = self.inner.lock().expect("ledger lock");
        inner.clients.entry(source.to_string()).or_default().validated += 1;
        inner.totals.counters.validated += 1;
    }

    /// Bytes received from `source`.
    pub fn add_rx(&self, source: &str, bytes: u64) {
        let mut inner = self.inner.lock().expect("ledger lock");
        inner.clients.entry(source.to_string()).or_default().rx += bytes;
        inner.totals.counters.rx += bytes;
    }

    /// Bytes sent to `source`.
    pub fn add_tx(&self, source: &str, bytes: u64) {
        let mut inner = self.inner.lock().expect("ledger lock");
        inner.clients.entry(source.to_string()).or_default().tx += bytes;
        inner.totals.counters.tx += bytes;
    }

    pub fn stats(&self) -> StatsSnapshot {
        let inner = self.inner.lock().expect("ledger lock");
        StatsSnapshot {
            sessions: inner.totals,
            clients: inner.clients.clone(),
        }
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn threshold_crossing_is_reported_once() {
        let ledger = Ledger::new();
        for i in 1..=BLACKLIST_THRESHOLD {
            let rec = ledger.record_decrypt_failure("10.0.0.9");
            assert_eq!(rec.count, i);
            assert!(!rec.crossed);
            assert!(!ledger.is_blacklisted("10.0.0.9"));
        }
        let rec = ledger.record_decrypt_failure("10.0.0.9");
        assert!(rec.crossed);
        assert!(ledger.is_blacklisted("10.0.0.9"));

        let rec = ledger.record_decrypt_failure("10.0.0.9");
        assert!(!rec.crossed);
    }

    #[test]
    fn success_clears_counter() {
        let ledger = Ledger::new();
        ledger.record_decrypt_failure("a");
        ledger.record_decrypt_failure("a");
        ledger.record_decrypt_success("a");
        assert_eq!(ledger.failures("a"), 0);
    }

    #[test]
    fn clear_one_or_all() {
        let ledger = Ledger::new();
        ledger.record_decrypt_failure("a");
        ledger.record_decrypt_failure("b");
        assert_eq!(ledger.clear_blacklist(Some("a")), 1);
        assert_eq!(ledger.clear_blacklist(Some("a")), 0);
        assert_eq!(ledger.clear_blacklist(None), 1);
        assert!(ledger.blacklist().is_empty());
    }

    #[test]
    fn stats_accumulate_per_source() {
        let ledger = Ledger::new();
        ledger.record_accepted("10.0.0.1");
        ledger.record_validated("10.0.0.1");
        ledger.add_rx("10.0.0.1", 100);
        ledger.add_tx("10.0.0.1", 40);
        ledger.record_accepted(LOCAL_SENDER);
        ledger.record_closed();

        let stats = ledger.stats();
        assert_eq!(stats.sessions.counters.accepted, 2);
        assert_eq!(stats.sessions.alive, 1);
        let c = stats.clients.get("10.0.0.1").unwrap();
        assert_eq!((c.accepted, c.validated, c.rx, c.tx), (1, 1, 100, 40));
    }

    #[test]
    fn counters_consistent_under_threads() {
        let ledger = Arc::new(Ledger::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    let src = format!("10.0.0.{}", t % 2);
                    for _ in 0..1000 {
                        ledger.record_accepted(&src);
                        ledger.add_rx(&src, 3);
                        ledger.add_tx(&src, 5);
                        ledger.record_closed();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = ledger.stats();
        assert_eq!(stats.sessions.counters.accepted, 8000);
        assert_eq!(stats.sessions.counters.rx, 24000);
        assert_eq!(stats.sessions.counters.tx, 40000);
        assert_eq!(stats.sessions.alive, 0);
        let per_source: u64 = stats.clients.values().map(|c| c.accepted).sum();
        assert_eq!(per_source, 8000);
    }
}
