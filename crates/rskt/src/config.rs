//! Library configuration.

use std::time::Duration;

use rskt_transport_shm::{PollPolicy, Transfer};

use crate::table::BLOCK_SIZE;

/// Tuning for an [`Rskt`](crate::Rskt) context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsktConfig {
    /// Upper bound on live sockets, rounded up to a multiple of 256.
    pub max_sockets: usize,
    /// Depth of the outbound control queue and the daemon-request queue.
    pub queue_depth: usize,
    /// How long a caller waits for a daemon response (accept waits forever).
    pub request_timeout: Duration,
    /// Budget for each handshake phase.
    pub handshake: PollPolicy,
    /// Budget for a writer waiting on free space.
    pub flow_control: PollPolicy,
    /// Budget for a reader waiting on data.
    pub read_wait: PollPolicy,
    /// Budget for waiting on the peer's CLOSING flag.
    pub close_wait: PollPolicy,
    /// Budget for a forced close waiting on a concurrent `close` to finish.
    pub forced_close_wait: PollPolicy,
    /// Primitive used to move bytes.
    pub transfer: Transfer,
}

const POLL_INTERVAL: Duration = Duration::from_millis(1);

impl Default for RsktConfig {
    fn default() -> Self {
        Self {
            max_sockets: 4 * BLOCK_SIZE,
            queue_depth: 64,
            request_timeout: Duration::from_secs(5),
            handshake: PollPolicy::with_budget(POLL_INTERVAL, Duration::from_secs(5)),
            flow_control: PollPolicy::with_budget(POLL_INTERVAL, Duration::from_secs(5)),
            read_wait: PollPolicy::with_budget(POLL_INTERVAL, Duration::from_secs(30)),
            close_wait: PollPolicy::with_budget(POLL_INTERVAL, Duration::from_secs(1)),
            forced_close_wait: PollPolicy::with_budget(POLL_INTERVAL, Duration::from_secs(2)),
            transfer: Transfer::Push,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

impl RsktConfig {
    /// Defaults overridden by `RSKT_*` environment variables.
    ///
    /// | variable | field |
    /// |----------|-------|
    /// | `RSKT_MAX_SOCKETS` | `max_sockets` |
    /// | `RSKT_QUEUE_DEPTH` | `queue_depth` |
    /// | `RSKT_REQUEST_TIMEOUT_MS` | `request_timeout` |
    /// | `RSKT_POLL_INTERVAL_US` | interval of every poll policy |
    /// | `RSKT_HANDSHAKE_TIMEOUT_MS` | `handshake` |
    /// | `RSKT_FLOW_CONTROL_TIMEOUT_MS` | `flow_control` |
    /// | `RSKT_READ_TIMEOUT_MS` | `read_wait` |
    /// | `RSKT_CLOSE_TIMEOUT_MS` | `close_wait` |
    /// | `RSKT_FORCED_CLOSE_TIMEOUT_MS` | `forced_close_wait` |
    /// | `RSKT_TRANSFER` (`push` or `dma`) | `transfer` |
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_parse::<usize>("RSKT_MAX_SOCKETS") {
            config.max_sockets = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("RSKT_QUEUE_DEPTH") {
            config.queue_depth = n.max(1);
        }
        if let Some(d) = env_millis("RSKT_REQUEST_TIMEOUT_MS") {
            config.request_timeout = d;
        }

        let interval = env_parse::<u64>("RSKT_POLL_INTERVAL_US")
            .map(Duration::from_micros)
            .filter(|d| !d.is_zero())
            .unwrap_or(POLL_INTERVAL);
        let policies = [
            ("RSKT_HANDSHAKE_TIMEOUT_MS", &mut config.handshake),
            ("RSKT_FLOW_CONTROL_TIMEOUT_MS", &mut config.flow_control),
            ("RSKT_READ_TIMEOUT_MS", &mut config.read_wait),
            ("RSKT_CLOSE_TIMEOUT_MS", &mut config.close_wait),
            ("RSKT_FORCED_CLOSE_TIMEOUT_MS", &mut config.forced_close_wait),
        ];
        for (var, policy) in policies {
            let budget = env_millis(var).unwrap_or_else(|| policy.budget());
            *policy = PollPolicy::with_budget(interval, budget);
        }

        match std::env::var("RSKT_TRANSFER").ok().as_deref() {
            Some("dma") => config.transfer = Transfer::Dma,
            Some("push") => config.transfer = Transfer::Push,
            _ => {}
        }
        config
    }

    /// Same budget for every poll policy. Handy in tests.
    pub fn with_poll_budget(mut self, interval: Duration, budget: Duration) -> Self {
        let policy = PollPolicy::with_budget(interval, budget);
        self.handshake = policy;
        self.flow_control = policy;
        self.read_wait = policy;
        self.close_wait = policy;
        self.forced_close_wait = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budgets() {
        let config = RsktConfig::default();
        assert_eq!(config.max_sockets % BLOCK_SIZE, 0);
        assert_eq!(config.handshake.budget(), Duration::from_secs(5));
        assert_eq!(config.close_wait.budget(), Duration::from_secs(1));
        assert_eq!(config.transfer, Transfer::Push);
    }

    #[test]
    fn test_with_poll_budget() {
        let config = RsktConfig::default()
            .with_poll_budget(Duration::from_millis(2), Duration::from_millis(40));
        for policy in [
            config.handshake,
            config.flow_control,
            config.read_wait,
            config.close_wait,
            config.forced_close_wait,
        ] {
            assert_eq!(policy.budget(), Duration::from_millis(40));
        }
    }
}
