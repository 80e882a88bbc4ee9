//! Fixed-interval polling
//!
//! A pass starts every `interval`. When a pass takes longer than the
//! interval a warning is logged and the next pass starts immediately; the
//! missed ticks are not replayed.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Periodic work run by the polling loop
#[async_trait]
pub trait PollTask: Send + Sync {
    /// Run one pass
    async fn run_pass(&self);
}

/// What to do after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassTiming {
    /// Pass finished early; sleep the remainder
    Sleep(Duration),
    /// Pass overran the interval by this much; start again now
    Overrun(Duration),
}

/// Timing decision for a pass that took `elapsed`
#[must_use]
pub fn pass_timing(interval: Duration, elapsed: Duration) -> PassTiming {
    if elapsed > interval {
        PassTiming::Overrun(elapsed - interval)
    } else {
        PassTiming::Sleep(interval - elapsed)
    }
}

/// Run `task` every `interval` until `cancel` fires
pub async fn run_polling_loop(interval: Duration, task: &dyn PollTask, cancel: &CancellationToken) {
    while !cancel.is_cancelled() {
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            () = task.run_pass() => {}
        }

        match pass_timing(interval, started.elapsed()) {
            PassTiming::Overrun(by) => {
                tracing::warn!(
                    interval_ms = interval.as_millis() as u64,
                    overrun_ms = by.as_millis() as u64,
                    "polling pass overran its interval"
                );
            }
            PassTiming::Sleep(remaining) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    () = tokio::time::sleep(remaining) => {}
                }
            }
        }
    }
    tracing::debug!("polling loop stopped");
}

/// Default pass: counts passes and logs a heartbeat
#[derive(Debug, Default)]
pub struct Heartbeat {
    passes: AtomicU64,
}

impl Heartbeat {
    /// Create heartbeat
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Passes run so far
    #[inline]
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PollTask for Heartbeat {
    async fn run_pass(&self) {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(pass, "polling heartbeat");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    /// Records pass start offsets and takes `cost` per pass
    struct TimedPass {
        origin: Instant,
        cost: Duration,
        starts: Mutex<Vec<Duration>>,
    }

    impl TimedPass {
        fn new(cost: Duration) -> Self {
            Self {
                origin: Instant::now(),
                cost,
                starts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PollTask for TimedPass {
        async fn run_pass(&self) {
            self.starts.lock().push(self.origin.elapsed());
            tokio::time::sleep(self.cost).await;
        }
    }

    async fn starts_of(cost: Duration, run_for: Duration) -> Vec<u64> {
        let task = Arc::new(TimedPass::new(cost));
        let cancel = CancellationToken::new();

        let handle = {
            let task = task.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_polling_loop(Duration::from_secs(2), task.as_ref(), &cancel).await;
            })
        };
        tokio::time::sleep(run_for).await;
        cancel.cancel();
        handle.await.unwrap();

        let starts = task.starts.lock();
        starts.iter().map(|d| d.as_millis() as u64).collect()
    }

    #[test]
    fn timing_decision() {
        let interval = Duration::from_secs(2);
        assert_eq!(
            pass_timing(interval, Duration::from_millis(500)),
            PassTiming::Sleep(Duration::from_millis(1500))
        );
        assert_eq!(
            pass_timing(interval, Duration::from_secs(3)),
            PassTiming::Overrun(Duration::from_secs(1))
        );
        assert_eq!(pass_timing(interval, interval), PassTiming::Sleep(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn short_passes_keep_the_cadence() {
        let starts = starts_of(Duration::from_millis(500), Duration::from_millis(5_100)).await;
        assert_eq!(starts, vec![0, 2_000, 4_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_passes_start_back_to_back() {
        let starts = starts_of(Duration::from_secs(3), Duration::from_millis(6_100)).await;
        assert_eq!(starts, vec![0, 3_000, 6_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_promptly() {
        let heartbeat = Heartbeat::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        run_polling_loop(Duration::from_secs(2), &heartbeat, &cancel).await;
        assert_eq!(heartbeat.passes(), 0);
    }
}
