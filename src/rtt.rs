//! Round-trip-time monitor: a background sampler that periodically pings a
//! connection and exposes the moving-average RTT.
//!
//! The sampling cadence and bounded-FIFO-with-running-sum shape are the same
//! pattern as [`crate::bandwidth::BandwidthCounter`]'s rate history; this
//! module is the RTT analogue named separately by spec.md §4.2.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::bandwidth::MAX_SAMPLE_DEPTH;

/// Cadence at which the background loop samples RTT.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Anything capable of measuring its own round-trip time. Implemented by
/// [`crate::connection::Connection`]. A trait rather than a concrete type so
/// the monitor can be unit-tested against a fake without a real socket
/// (spec.md §9's "Dynamic polymorphism over the connection").
#[async_trait]
pub trait PingSource: Send + Sync {
    /// Issues a protocol-level ping and returns the elapsed round trip in
    /// microseconds, or `0` on ping error (transient failures are expected
    /// and are the caller's responsibility to retry).
    async fn measure_rtt(&self) -> u64;
}

struct Inner {
    history: VecDeque<u64>,
    sum: u64,
}

/// Bounded moving-average RTT estimator for a single connection.
pub struct RttMonitor {
    inner: Mutex<Inner>,
    first_sample: Notify,
    started: std::sync::atomic::AtomicBool,
}

impl RttMonitor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                history: VecDeque::with_capacity(MAX_SAMPLE_DEPTH),
                sum: 0,
            }),
            first_sample: Notify::new(),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Launches background sampling against `source` and blocks until the
    /// first non-zero sample has been recorded. Spawns onto the current
    /// Tokio runtime; the returned `JoinHandle` runs for the lifetime of the
    /// connection.
    pub async fn start(self: &std::sync::Arc<Self>, source: std::sync::Arc<dyn PingSource>) {
        use std::sync::atomic::Ordering;

        // Register as a waiter before spawning the sampler so a fast first
        // sample can't notify_waiters() before we start awaiting it.
        let notified = self.first_sample.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let this = self.clone();
        tokio::spawn(async move {
            let mut first = true;
            loop {
                tokio::time::sleep(SAMPLE_INTERVAL).await;
                let sample = source.measure_rtt().await;

                if first {
                    if sample == 0 {
                        debug!("rtt: transient ping failure during startup, retrying");
                        continue;
                    }
                    first = false;
                    this.push_sample(sample);
                    this.started.store(true, Ordering::SeqCst);
                    this.first_sample.notify_waiters();
                } else if sample == 0 {
                    warn!("rtt: ping failed, skipping this round");
                } else {
                    this.push_sample(sample);
                }
            }
        });

        if !self.started.load(Ordering::SeqCst) {
            notified.await;
        }
    }

    fn push_sample(&self, micros: u64) {
        let mut inner = self.inner.lock().expect("rtt monitor poisoned");
        inner.history.push_back(micros);
        inner.sum += micros;
        if inner.history.len() > MAX_SAMPLE_DEPTH {
            if let Some(oldest) = inner.history.pop_front() {
                inner.sum -= oldest;
            }
        }
    }

    /// Current moving-average RTT in microseconds. `0` only if called
    /// before `start`'s first-sample wait completes, which the design
    /// disallows.
    pub fn get_rtt(&self) -> u64 {
        let inner = self.inner.lock().expect("rtt monitor poisoned");
        if inner.history.is_empty() {
            0
        } else {
            inner.sum / inner.history.len() as u64
        }
    }
}

impl Default for RttMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakePings {
        call: AtomicUsize,
        samples: Vec<u64>,
    }

    #[async_trait]
    impl PingSource for FakePings {
        async fn measure_rtt(&self) -> u64 {
            let i = self.call.fetch_add(1, Ordering::SeqCst);
            self.samples.get(i).copied().unwrap_or(*self.samples.last().unwrap())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_until_first_nonzero_sample() {
        let source: Arc<dyn PingSource> = Arc::new(FakePings {
            call: AtomicUsize::new(0),
            samples: vec![0, 0, 0, 40_000, 40_000, 40_000],
        });
        let monitor = Arc::new(RttMonitor::new());

        let handle = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor.start(source).await;
            })
        };

        // Advance virtual time enough for the retries to resolve.
        tokio::time::advance(Duration::from_millis(100 * 5)).await;
        tokio::time::resume();
        handle.await.unwrap();

        assert!(monitor.get_rtt() > 0);
    }

    #[test]
    fn moving_average_is_bounded() {
        let monitor = RttMonitor::new();
        for i in 1..=10u64 {
            monitor.push_sample(i * 1000);
        }
        let inner = monitor.inner.lock().unwrap();
        assert!(inner.history.len() <= MAX_SAMPLE_DEPTH);
    }
}
