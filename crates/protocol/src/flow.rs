use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{ProtocolError, ProtocolResult};
use crate::limits::{FLOW_CHUNK, FLOW_THRESHOLD, FLOW_WINDOW, RATE_LIMIT, RATE_LIMIT_BURST};

/// Flow-controller tunables.
#[derive(Clone, Copy, Debug)]
pub struct FlowConfig {
    /// Sustained send rate in bytes per second.
    pub rate: u64,
    /// Largest single acquisition.
    pub burst: u64,
    /// Ceiling on in-flight (acquired but unreleased) bytes.
    pub window: u64,
    /// In-flight level at which a blocked sender may resume.
    pub threshold: u64,
    /// How long an acquisition may wait before failing.
    pub acquire_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            rate: RATE_LIMIT,
            burst: RATE_LIMIT_BURST,
            window: FLOW_WINDOW,
            threshold: FLOW_THRESHOLD,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

struct RateBucket {
    second_start: Instant,
    used: u64,
}

/// Combined sliding-window and rate budget for one connection's writer.
///
/// The window tracks acquired-but-unreleased bytes with a lock-free
/// counter; the per-second rate bucket sits behind a mutex that is touched
/// once per acquisition. Senders acquire in [`FLOW_CHUNK`] slices, sleep
/// briefly whenever either budget is exhausted, and give up with
/// [`ProtocolError::FlowControl`] after the configured deadline.
pub struct FlowController {
    config: FlowConfig,
    in_flight: AtomicU64,
    saturated: AtomicBool,
    rate: Mutex<RateBucket>,
}

impl FlowController {
    /// Controller with the given budgets.
    #[must_use]
    pub fn new(config: FlowConfig) -> Self {
        assert!(config.rate > 0, "rate must be positive");
        assert!(config.window > 0, "window must be positive");
        Self {
            config,
            in_flight: AtomicU64::new(0),
            saturated: AtomicBool::new(false),
            rate: Mutex::new(RateBucket {
                second_start: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Bytes currently acquired and not yet released.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Acquires budget for `size` bytes, waiting as needed.
    ///
    /// `size` is capped by the burst limit; larger sends must be split by
    /// the caller (see [`chunks`]).
    pub async fn acquire(&self, size: u64) -> ProtocolResult<()> {
        if size == 0 {
            return Ok(());
        }
        if size > self.config.burst {
            return Err(ProtocolError::Size {
                actual: size as usize,
                limit: self.config.burst as usize,
            });
        }

        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            if self.try_acquire(size) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                trace!(size, in_flight = self.in_flight(), "flow budget exhausted");
                return Err(ProtocolError::FlowControl);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Single non-blocking attempt at both budgets.
    fn try_acquire(&self, size: u64) -> bool {
        let current = self.in_flight.load(Ordering::Acquire);

        // Window gate with hysteresis: once the window fills, stay blocked
        // until the pipe drains to the resume threshold.
        if self.saturated.load(Ordering::Acquire) {
            if current > self.config.threshold {
                return false;
            }
            self.saturated.store(false, Ordering::Release);
        }
        if current != 0 && current.saturating_add(size) > self.config.window {
            self.saturated.store(true, Ordering::Release);
            return false;
        }

        let mut bucket = self.rate.lock().expect("flow lock poisoned");
        let now = Instant::now();
        if now.duration_since(bucket.second_start) >= Duration::from_secs(1) {
            bucket.second_start = now;
            bucket.used = 0;
        }
        if bucket.used.saturating_add(size) > self.config.rate {
            return false;
        }
        bucket.used += size;
        drop(bucket);

        self.in_flight.fetch_add(size, Ordering::AcqRel);
        true
    }

    /// Returns budget after the bytes left the socket.
    pub fn release(&self, size: u64) {
        if size == 0 {
            return;
        }
        let previous = self.in_flight.fetch_sub(size, Ordering::AcqRel);
        debug_assert!(previous >= size, "released more than acquired");
    }
}

/// Splits `total` bytes into flow-control acquisition chunks.
pub fn chunks(total: usize) -> impl Iterator<Item = u64> {
    let full = total / FLOW_CHUNK;
    let tail = total % FLOW_CHUNK;
    (0..full)
        .map(|_| FLOW_CHUNK as u64)
        .chain((tail > 0).then_some(tail as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: u64, window: u64) -> FlowConfig {
        FlowConfig {
            rate,
            burst: rate,
            window,
            threshold: window / 2,
            acquire_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn chunking_covers_the_whole_length() {
        let total = 3 * FLOW_CHUNK + 123;
        let parts: Vec<u64> = chunks(total).collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts.iter().sum::<u64>(), total as u64);
        assert!(parts[..3].iter().all(|c| *c == FLOW_CHUNK as u64));
        assert_eq!(parts[3], 123);
    }

    #[test]
    fn chunking_empty_is_empty() {
        assert_eq!(chunks(0).count(), 0);
    }

    #[tokio::test]
    async fn acquire_within_budget_is_immediate() {
        let flow = FlowController::new(config(1 << 20, 1 << 20));
        flow.acquire(1024).await.expect("budget available");
        assert_eq!(flow.in_flight(), 1024);
        flow.release(1024);
        assert_eq!(flow.in_flight(), 0);
    }

    #[tokio::test]
    async fn oversized_acquisition_is_rejected() {
        let flow = FlowController::new(config(1024, 1 << 20));
        assert!(matches!(
            flow.acquire(4096).await,
            Err(ProtocolError::Size { .. })
        ));
    }

    #[tokio::test]
    async fn full_window_blocks_until_release() {
        let flow = std::sync::Arc::new(FlowController::new(config(1 << 30, 1024)));
        flow.acquire(1024).await.expect("fills window");

        let waiter = {
            let flow = std::sync::Arc::clone(&flow);
            tokio::spawn(async move { flow.acquire(512).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished(), "second acquire must wait");

        flow.release(1024);
        waiter
            .await
            .expect("task completes")
            .expect("budget freed");
    }

    #[tokio::test]
    async fn window_starvation_times_out_with_flow_error() {
        let flow = FlowController::new(config(1 << 30, 1024));
        flow.acquire(1024).await.expect("fills window");
        assert!(matches!(
            flow.acquire(512).await,
            Err(ProtocolError::FlowControl)
        ));
    }

    #[tokio::test]
    async fn rate_bucket_spreads_bytes_over_seconds() {
        // 64 KiB/s rate; sending 128 KiB must take at least one bucket
        // reset, so more than ~0.9s.
        let flow = FlowController::new(FlowConfig {
            rate: 64 * 1024,
            burst: 64 * 1024,
            window: 1 << 30,
            threshold: 1 << 29,
            acquire_timeout: Duration::from_secs(10),
        });

        let start = Instant::now();
        for _ in 0..2 {
            flow.acquire(64 * 1024).await.expect("within budget");
            flow.release(64 * 1024);
        }
        assert!(
            start.elapsed() >= Duration::from_millis(900),
            "rate limiting must delay the second acquisition"
        );
    }
}
