use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoordError;

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024;
pub const MAX_CONNECTIONS: usize = 64;

/// Member slots reported by the local group roster.
pub const GROUP_SLOTS: usize = 6;

/// Wire and export representation of a field that has not been loaded.
pub const UNKNOWN: &str = "---";

pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 2000;

#[derive(Clone, Copy, Debug)]
pub struct NodeConfig {
    pub is_master: bool,
    pub status_poll_interval_ms: u64,
    pub query_timeout_ms: u64,
    pub query_poll_interval_ms: u64,
    pub inbound_capacity: usize,
    pub send_queue_capacity: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            is_master: false,
            status_poll_interval_ms: 10_000,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            query_poll_interval_ms: 100,
            inbound_capacity: 256,
            send_queue_capacity: 1024,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
            handshake_timeout_ms: 5000,
        }
    }
}

impl NodeConfig {
    pub fn master() -> Self {
        Self {
            is_master: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoordError> {
        let err = |msg: &str| Err(CoordError::InvalidArgument(msg.into()));

        if self.status_poll_interval_ms == 0 {
            return err("status_poll_interval_ms must be > 0");
        }
        if self.query_poll_interval_ms == 0 {
            return err("query_poll_interval_ms must be > 0");
        }
        if self.query_timeout_ms < self.query_poll_interval_ms {
            return err("query_timeout_ms must be >= query_poll_interval_ms");
        }
        if self.inbound_capacity == 0 {
            return err("inbound_capacity must be > 0");
        }
        if self.send_queue_capacity == 0 {
            return err("send_queue_capacity must be > 0");
        }
        if self.reconnect_initial_ms == 0 {
            return err("reconnect_initial_ms must be > 0");
        }
        if self.reconnect_initial_ms > self.reconnect_max_ms {
            return err("reconnect_initial_ms must be <= reconnect_max_ms");
        }
        if self.handshake_timeout_ms == 0 {
            return err("handshake_timeout_ms must be > 0");
        }

        Ok(())
    }

    pub fn query_poll_interval(&self) -> Duration {
        Duration::from_millis(self.query_poll_interval_ms)
    }
}

/// Knobs supplied by the caller for one formation run. Every settle
/// delay is a multiple of `delay_ms`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct FormationOptions {
    pub delay_ms: u64,
    pub max_retries: u32,
    pub keep_raid: bool,
    pub join_poll_interval_ms: u64,
    /// Per-query timeout. `None` takes the node's `query_timeout_ms`.
    pub query_timeout_ms: Option<u64>,
}

impl Default for FormationOptions {
    fn default() -> Self {
        Self {
            delay_ms: 100,
            max_retries: 3,
            keep_raid: false,
            join_poll_interval_ms: 500,
            query_timeout_ms: None,
        }
    }
}

impl FormationOptions {
    pub fn validate(&self) -> Result<(), CoordError> {
        let err = |msg: &str| Err(CoordError::InvalidArgument(msg.into()));

        if self.delay_ms == 0 {
            return err("delay_ms must be > 0");
        }
        if self.join_poll_interval_ms == 0 {
            return err("join_poll_interval_ms must be > 0");
        }
        if self.query_timeout_ms == Some(0) {
            return err("query_timeout_ms must be > 0");
        }

        Ok(())
    }

    fn scaled(&self, factor: u64) -> Duration {
        Duration::from_millis(self.delay_ms.saturating_mul(factor))
    }

    /// Pause after a disband pass.
    pub fn settle_delay(&self) -> Duration {
        self.scaled(10)
    }

    /// Pause after re-inviting during a retry.
    pub fn retry_invite_delay(&self) -> Duration {
        self.scaled(20)
    }

    /// Upper bound on waiting for invited members to show up.
    pub fn max_join_wait(&self) -> Duration {
        self.scaled(50)
    }

    /// Pause between role commands.
    pub fn role_delay(&self) -> Duration {
        self.scaled(5)
    }

    pub fn join_poll_interval(&self) -> Duration {
        Duration::from_millis(self.join_poll_interval_ms)
    }

    /// Fill in the query timeout when the caller left it unset.
    pub fn or_query_timeout(mut self, query_timeout_ms: u64) -> Self {
        self.query_timeout_ms.get_or_insert(query_timeout_ms);
        self
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms.unwrap_or(DEFAULT_QUERY_TIMEOUT_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_valid() {
        assert!(NodeConfig::default().validate().is_ok());
        assert!(NodeConfig::master().validate().is_ok());
        assert!(NodeConfig::master().is_master);
        assert!(FormationOptions::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = NodeConfig::default();

        config.status_poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.status_poll_interval_ms = 10_000;

        config.query_poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.query_poll_interval_ms = 100;

        config.query_timeout_ms = 50;
        assert!(config.validate().is_err());
        config.query_timeout_ms = 2000;

        config.reconnect_initial_ms = 0;
        assert!(config.validate().is_err());
        config.reconnect_initial_ms = 1000;

        config.reconnect_max_ms = 500;
        assert!(config.validate().is_err());
        config.reconnect_max_ms = 30_000;

        config.send_queue_capacity = 0;
        assert!(config.validate().is_err());
        config.send_queue_capacity = 1024;

        config.inbound_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_formation_delays_scale_with_base() {
        let opts = FormationOptions {
            delay_ms: 7,
            ..FormationOptions::default()
        };
        assert_eq!(opts.settle_delay(), Duration::from_millis(70));
        assert_eq!(opts.retry_invite_delay(), Duration::from_millis(140));
        assert_eq!(opts.max_join_wait(), Duration::from_millis(350));
        assert_eq!(opts.role_delay(), Duration::from_millis(35));
    }

    #[test]
    fn test_formation_options_validation() {
        let mut opts = FormationOptions::default();
        opts.delay_ms = 0;
        assert!(opts.validate().is_err());
        opts.delay_ms = 100;

        opts.join_poll_interval_ms = 0;
        assert!(opts.validate().is_err());
        opts.join_poll_interval_ms = 500;

        opts.query_timeout_ms = Some(0);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_query_timeout_falls_back_to_node() {
        let opts = FormationOptions::default();
        assert_eq!(opts.query_timeout(), Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS));
        assert_eq!(opts.or_query_timeout(500).query_timeout(), Duration::from_millis(500));

        let explicit = FormationOptions {
            query_timeout_ms: Some(100),
            ..FormationOptions::default()
        };
        assert_eq!(explicit.or_query_timeout(500).query_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_formation_options_partial_json() {
        let opts: FormationOptions =
            serde_json::from_str(r#"{"keep_raid": true, "max_retries": 5}"#).unwrap();
        assert!(opts.keep_raid);
        assert_eq!(opts.max_retries, 5);
        assert_eq!(opts.delay_ms, 100);
        assert_eq!(opts.query_timeout_ms, None);

        let opts: FormationOptions = serde_json::from_str(r#"{"query_timeout_ms": 750}"#).unwrap();
        assert_eq!(opts.query_timeout_ms, Some(750));
    }
}
