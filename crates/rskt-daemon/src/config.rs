//! Daemon configuration.

use std::ops::RangeInclusive;
use std::time::Duration;

use rskt_transport_shm::{LayoutError, RingLayout, DEFAULT_BUFFER_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Fabric component tag of this node.
    pub component_tag: u32,
    /// Ring size handed to every new connection.
    pub buffer_size: u32,
    /// Cap on the backlog a listener may ask for.
    pub max_backlog: u32,
    /// Socket numbers handed out when a caller does not pick one.
    pub dynamic_range: RangeInclusive<u32>,
    /// How long a forced close waits for the library's acknowledgement.
    pub forced_close_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            component_tag: 1,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_backlog: 128,
            dynamic_range: 4096..=65535,
            forced_close_timeout: Duration::from_secs(3),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

impl DaemonConfig {
    /// Defaults overridden by `RSKT_COMPONENT_TAG`, `RSKT_BUFFER_SIZE`,
    /// `RSKT_MAX_BACKLOG`, `RSKT_DYNAMIC_SN_MIN`, `RSKT_DYNAMIC_SN_MAX` and
    /// `RSKT_FORCED_CLOSE_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(tag) = env_parse("RSKT_COMPONENT_TAG") {
            config.component_tag = tag;
        }
        if let Some(size) = env_parse("RSKT_BUFFER_SIZE") {
            config.buffer_size = size;
        }
        if let Some(n) = env_parse("RSKT_MAX_BACKLOG") {
            config.max_backlog = n;
        }
        let lo = env_parse("RSKT_DYNAMIC_SN_MIN").unwrap_or(*config.dynamic_range.start());
        let hi = env_parse("RSKT_DYNAMIC_SN_MAX").unwrap_or(*config.dynamic_range.end());
        config.dynamic_range = lo..=hi;
        if let Some(ms) = env_parse("RSKT_FORCED_CLOSE_TIMEOUT_MS") {
            config.forced_close_timeout = Duration::from_millis(ms);
        }
        config
    }

    /// Reject a buffer size the ring cannot use and an empty or zero-based
    /// dynamic range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        RingLayout::new(self.buffer_size)?;
        if self.dynamic_range.is_empty() || *self.dynamic_range.start() == 0 {
            return Err(ConfigError::DynamicRange(self.dynamic_range.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("dynamic socket-number range {0:?} is empty or includes 0")]
    DynamicRange(RangeInclusive<u32>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(DaemonConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_bad_buffer_size() {
        let config = DaemonConfig {
            buffer_size: 1000,
            ..DaemonConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Layout(_))));
    }

    #[test]
    fn test_rejects_zero_in_range() {
        let config = DaemonConfig {
            dynamic_range: 0..=10,
            ..DaemonConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::DynamicRange(_))));
    }
}
