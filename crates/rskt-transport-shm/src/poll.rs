//! Bounded polling.
//!
//! Everything that waits on remote memory (handshake phases, free space,
//! incoming bytes, the peer's CLOSING flag) goes through [`poll_until`], so
//! there is exactly one place that decides how long to spin and when to
//! give up.

use std::task::Poll;
use std::time::Duration;

/// How a wait on remote memory is paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep between probes once spinning is over.
    pub interval: Duration,
    /// Leading probes that only yield to the scheduler.
    pub spin_attempts: u32,
    /// Total probes before giving up.
    pub max_attempts: u32,
}

impl PollPolicy {
    pub const DEFAULT_SPIN_ATTEMPTS: u32 = 16;

    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            spin_attempts: Self::DEFAULT_SPIN_ATTEMPTS,
            max_attempts,
        }
    }

    /// A policy that waits roughly `budget` in steps of `interval`.
    pub fn with_budget(interval: Duration, budget: Duration) -> Self {
        let steps = budget.as_nanos() / interval.as_nanos().max(1);
        let steps = u32::try_from(steps).unwrap_or(u32::MAX);
        Self::new(interval, steps.saturating_add(Self::DEFAULT_SPIN_ATTEMPTS).max(1))
    }

    pub const fn spin_attempts(mut self, spin_attempts: u32) -> Self {
        self.spin_attempts = spin_attempts;
        self
    }

    /// Upper bound on the time spent sleeping.
    pub fn budget(&self) -> Duration {
        let sleeping = self.max_attempts.saturating_sub(self.spin_attempts);
        self.interval.saturating_mul(sleeping)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1), 5_000)
    }
}

/// The probe never became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("condition not reached after {attempts} probes")]
pub struct PollTimeout {
    pub attempts: u32,
}

/// Probe until it returns [`Poll::Ready`] or the policy runs out.
///
/// The probe runs at least once. It must not block: it inspects memory and
/// returns.
pub async fn poll_until<T>(
    policy: &PollPolicy,
    mut probe: impl FnMut() -> Poll<T>,
) -> Result<T, PollTimeout> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 0..attempts {
        if let Poll::Ready(value) = probe() {
            return Ok(value);
        }
        if attempt + 1 == attempts {
            break;
        }
        if attempt < policy.spin_attempts {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Err(PollTimeout { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_immediately() {
        let policy = PollPolicy::new(Duration::from_millis(1), 1);
        assert_eq!(poll_until(&policy, || Poll::Ready(7)).await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_sleeping() {
        let policy = PollPolicy::new(Duration::from_millis(10), 100).spin_attempts(2);
        let mut probes = 0;
        let out = poll_until(&policy, || {
            probes += 1;
            if probes == 5 {
                Poll::Ready(probes)
            } else {
                Poll::Pending
            }
        })
        .await;
        assert_eq!(out, Ok(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let policy = PollPolicy::new(Duration::from_millis(1), 20).spin_attempts(4);
        let mut probes = 0u32;
        let out: Result<(), _> = poll_until(&policy, || {
            probes += 1;
            Poll::Pending
        })
        .await;
        assert_eq!(out, Err(PollTimeout { attempts: 20 }));
        assert_eq!(probes, 20);
    }

    #[test]
    fn test_budget() {
        let policy = PollPolicy::with_budget(Duration::from_millis(2), Duration::from_millis(100));
        assert_eq!(policy.max_attempts, 50 + PollPolicy::DEFAULT_SPIN_ATTEMPTS);
        assert_eq!(policy.budget(), Duration::from_millis(100));
        assert_eq!(PollPolicy::default().budget(), Duration::from_millis(4_984));
    }
}
