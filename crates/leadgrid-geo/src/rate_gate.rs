//! Process-wide minimum-interval gate.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum interval between consecutive callers.
///
/// One gate is shared by `Arc` across every job in the process. The lock is
/// held while sleeping, so waiters are released one at a time in lock order.
#[derive(Debug)]
pub struct RateGate {
    last: Mutex<Option<Instant>>,
    interval: Duration,
}

impl RateGate {
    /// Create a gate that allows one pass per `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            interval,
        }
    }

    /// Create a gate allowing `per_second` passes per second (0 = ungated).
    #[must_use]
    pub fn per_second(per_second: u32) -> Self {
        if per_second == 0 {
            return Self::new(Duration::ZERO);
        }
        Self::new(Duration::from_secs(1) / per_second)
    }

    /// Configured interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until at least `interval` has passed since the previous pass.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_first_pass_is_immediate() {
        let gate = RateGate::new(Duration::from_secs(1));
        let start = Instant::now();
        gate.wait().await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_passes_are_spaced() {
        let gate = RateGate::new(Duration::from_secs(1));
        let start = Instant::now();
        gate.wait().await;
        gate.wait().await;
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_gate_spaces_concurrent_callers() {
        let gate = Arc::new(RateGate::new(Duration::from_secs(1)));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    gate.wait().await;
                    Instant::now()
                })
            })
            .collect();

        let mut passes = Vec::new();
        for handle in handles {
            passes.push(handle.await.expect("task completes"));
        }
        passes.sort();

        for pair in passes.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_per_second() {
        assert_eq!(RateGate::per_second(5).interval(), Duration::from_millis(200));
        assert_eq!(RateGate::per_second(0).interval(), Duration::ZERO);
    }
}
