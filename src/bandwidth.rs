//! Per-connection bandwidth counter and its sliding-window rate estimator.
//!
//! Grounded in the teacher's `downloader.rs` (`AtomicU64` byte counters,
//! `SharedRateLimiter`'s periodic-refill sampling loop) but reshaped around
//! the exact operations spec.md §4.1 names, since the teacher counts bytes
//! to *throttle* a single connection rather than to *estimate a rate feeding
//! a scheduler*. The process-wide trace-file map is the one piece of global
//! state the design calls for (spec.md §9); everything else is per-counter.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use once_cell::sync::Lazy;

/// Bounded window size shared by the rate estimator and the RTT monitor.
pub const MAX_SAMPLE_DEPTH: usize = 5;

static GLOBAL_START: OnceLock<Instant> = OnceLock::new();

/// Sets the instant trace timestamps are relative to. Idempotent: only the
/// first call has any effect, matching "globalStart" being fixed at program
/// start (spec.md glossary).
pub fn init_global_start() {
    let _ = GLOBAL_START.set(Instant::now());
}

fn ms_since_start() -> u64 {
    GLOBAL_START
        .get()
        .expect("init_global_start must run before any trace write")
        .elapsed()
        .as_millis() as u64
}

static TRACE_FILES: Lazy<Mutex<HashMap<u32, File>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn trace_line(id: u32, line: &str) {
    let mut files = TRACE_FILES.lock().expect("trace file map poisoned");
    let file = files.entry(id).or_insert_with(|| {
        OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(format!("{id}.dat"))
            .expect("failed to open per-connection trace file")
    });
    let _ = file.write_all(line.as_bytes());
}

struct Inner {
    total: u64,
    offset: Option<u64>,
    history: VecDeque<f64>,
    rate_sum: f64,
}

impl Inner {
    fn fresh(history: VecDeque<f64>, rate_sum: f64) -> Self {
        Self {
            total: 0,
            offset: None,
            history,
            rate_sum,
        }
    }
}

/// Per-connection mutable state described in spec.md §3. All field updates
/// are serialized by a single mutex (spec.md §5's "Ordering guarantees").
pub struct BandwidthCounter {
    id: u32,
    inner: Mutex<Inner>,
}

impl BandwidthCounter {
    /// Creates a counter with an empty rate history, used the first time a
    /// connection is seen.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner::fresh(VecDeque::with_capacity(MAX_SAMPLE_DEPTH), 0.0)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Must be called before the first `write` of a new request cycle
    /// (invariant I4). Writing before this is a programming error.
    pub fn set_offset(&self, n: u64) {
        let mut inner = self.inner.lock().expect("bandwidth counter poisoned");
        inner.offset = Some(n);
    }

    /// Called on the I/O path as the response body is consumed. Increments
    /// `total` by `p.len()`, appends a trace line, and returns `p.len()`.
    pub fn write(&self, p: &[u8]) -> usize {
        let (total_plus_offset, id) = {
            let mut inner = self.inner.lock().expect("bandwidth counter poisoned");
            let offset = inner
                .offset
                .expect("BandwidthCounter::write called before set_offset (I4 violation)");
            inner.total += p.len() as u64;
            (inner.total + offset, self.id)
        };
        trace_line(id, &format!("{} {}\n", ms_since_start(), total_plus_offset));
        p.len()
    }

    /// Total bytes transferred since the last reset.
    pub fn total(&self) -> u64 {
        self.inner.lock().expect("bandwidth counter poisoned").total
    }

    /// Appends `r` (bytes/second, `r >= 0`) to the rate history, evicting
    /// the oldest sample once the window is over capacity. Panics on a
    /// negative rate or a negative running sum: both indicate a
    /// correctness bug upstream, per spec.md §7.
    pub fn add_rate(&self, r: f64) {
        assert!(r >= 0.0, "AddRate called with negative rate: {r}");
        let mut inner = self.inner.lock().expect("bandwidth counter poisoned");
        inner.history.push_back(r);
        inner.rate_sum += r;
        if inner.history.len() > MAX_SAMPLE_DEPTH {
            if let Some(oldest) = inner.history.pop_front() {
                inner.rate_sum -= oldest;
            }
        }
        assert!(
            inner.rate_sum >= -1e-6,
            "rateSum went negative: {}",
            inner.rate_sum
        );
        if inner.rate_sum < 0.0 {
            inner.rate_sum = 0.0;
        }
    }

    /// `rateSum / len(history)`, or `0` when the window is empty. Unit:
    /// bytes/second.
    pub fn rate(&self) -> f64 {
        let inner = self.inner.lock().expect("bandwidth counter poisoned");
        if inner.history.is_empty() {
            0.0
        } else {
            inner.rate_sum / inner.history.len() as f64
        }
    }

    /// Zeros `total` only; `history`/`rate_sum` survive so the rate
    /// estimate carries across successive sub-ranges of the same
    /// connection.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("bandwidth counter poisoned");
        inner.total = 0;
        inner.offset = None;
    }

    /// Returns a new counter inheriting `history`/`rate_sum` but with
    /// `total = 0` and `offset` unset, used when recursing into
    /// sub-ranges (spec.md §4.3.6).
    pub fn duplicate(&self, new_id: u32) -> Self {
        let inner = self.inner.lock().expect("bandwidth counter poisoned");
        Self {
            id: new_id,
            inner: Mutex::new(Inner::fresh(inner.history.clone(), inner.rate_sum)),
        }
    }

    /// Invariant I2/I3 checker used by tests.
    #[cfg(test)]
    fn check_invariants(&self) {
        let inner = self.inner.lock().unwrap();
        let sum: f64 = inner.history.iter().sum();
        assert!((sum - inner.rate_sum).abs() < 1e-6);
        assert!(inner.history.len() <= MAX_SAMPLE_DEPTH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_mean_of_window() {
        let c = BandwidthCounter::new(0);
        c.add_rate(100.0);
        c.add_rate(200.0);
        assert_eq!(c.rate(), 150.0);
        c.check_invariants();
    }

    #[test]
    fn window_evicts_oldest() {
        let c = BandwidthCounter::new(0);
        for i in 0..10 {
            c.add_rate(i as f64);
        }
        c.check_invariants();
        // last 5 samples: 5,6,7,8,9 -> mean 7
        assert_eq!(c.rate(), 7.0);
    }

    #[test]
    fn empty_window_rate_is_zero() {
        let c = BandwidthCounter::new(0);
        assert_eq!(c.rate(), 0.0);
    }

    #[test]
    #[should_panic(expected = "negative rate")]
    fn negative_rate_panics() {
        let c = BandwidthCounter::new(0);
        c.add_rate(-1.0);
    }

    #[test]
    fn reset_preserves_history() {
        let c = BandwidthCounter::new(0);
        c.set_offset(10);
        c.add_rate(42.0);
        c.write(&[1, 2, 3]);
        assert_eq!(c.total(), 3);
        c.reset();
        assert_eq!(c.total(), 0);
        assert_eq!(c.rate(), 42.0);
    }

    #[test]
    #[should_panic(expected = "I4 violation")]
    fn write_before_offset_panics() {
        let c = BandwidthCounter::new(0);
        c.write(&[1]);
    }

    #[test]
    fn duplicate_inherits_rate_not_progress() {
        let c = BandwidthCounter::new(0);
        c.add_rate(500.0);
        c.set_offset(0);
        c.write(&[0u8; 16]);
        let d = c.duplicate(1);
        assert_eq!(d.rate(), c.rate());
        assert_eq!(d.total(), 0);
    }
}
