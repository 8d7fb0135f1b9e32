//! Configuration types and defaults

use gridlink_core::{GridError, TierTimeouts, DEFAULT_REFRESH_INTERVAL, DEFAULT_WARNING_THRESHOLDS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection policy
///
/// The delay before attempt `n` is `delays[n - 1]` when present, otherwise
/// `retry_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay used when `delays` has no entry for an attempt
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Per-attempt delays
    #[serde(with = "duration_ms_list")]
    pub delays: Vec<Duration>,
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        attempt
            .checked_sub(1)
            .and_then(|i| self.delays.get(i as usize))
            .copied()
            .unwrap_or(self.retry_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(2),
            delays: Vec::new(),
        }
    }
}

/// Connection manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Timeout of the direct tier
    #[serde(with = "duration_ms")]
    pub p2p_timeout: Duration,
    /// Timeout of the reflection-assisted tier
    #[serde(with = "duration_ms")]
    pub stun_timeout: Duration,
    /// Timeout of the relayed tier
    #[serde(with = "duration_ms")]
    pub turn_timeout: Duration,
    /// Period of the stats sampler
    #[serde(with = "duration_ms")]
    pub stats_interval: Duration,
    /// Period of the usage reporter
    #[serde(with = "duration_ms")]
    pub report_interval: Duration,
    /// Period of the quota refresh
    #[serde(with = "duration_ms")]
    pub quota_refresh_interval: Duration,
    /// Quota warning thresholds (percent)
    pub warning_thresholds: Vec<u8>,
    /// STUN server URLs for the reflection-assisted tier
    pub stun_servers: Vec<String>,
    /// Reconnection policy
    pub reconnect: ReconnectPolicy,
}

impl Default for GridConfig {
    fn default() -> Self {
        let timeouts = TierTimeouts::default();
        Self {
            p2p_timeout: timeouts.p2p,
            stun_timeout: timeouts.stun,
            turn_timeout: timeouts.turn,
            stats_interval: Duration::from_secs(1),
            report_interval: Duration::from_secs(5),
            quota_refresh_interval: DEFAULT_REFRESH_INTERVAL,
            warning_thresholds: DEFAULT_WARNING_THRESHOLDS.to_vec(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl GridConfig {
    /// Preset for mobile networks: slower tiers, less frequent sampling,
    /// and a growing reconnection delay
    pub fn mobile() -> Self {
        Self {
            p2p_timeout: Duration::from_secs(15),
            stun_timeout: Duration::from_secs(15),
            turn_timeout: Duration::from_secs(30),
            stats_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            reconnect: ReconnectPolicy {
                max_attempts: 8,
                retry_delay: Duration::from_secs(16),
                delays: [1, 2, 4, 8]
                    .into_iter()
                    .map(Duration::from_secs)
                    .collect(),
            },
            ..Self::default()
        }
    }

    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, GridError> {
        serde_json::from_str(json).map_err(|e| GridError::InvalidMessage {
            message: "grid configuration".to_string(),
            source: e.into(),
        })
    }

    /// Per-tier timeouts
    pub fn tier_timeouts(&self) -> TierTimeouts {
        TierTimeouts {
            p2p: self.p2p_timeout,
            stun: self.stun_timeout,
            turn: self.turn_timeout,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod duration_ms_list {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(value.iter().map(|d| d.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        Vec::<u64>::deserialize(deserializer)
            .map(|ms| ms.into_iter().map(Duration::from_millis).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GridConfig::default();
        assert_eq!(config.p2p_timeout, Duration::from_secs(10));
        assert_eq!(config.turn_timeout, Duration::from_secs(20));
        assert_eq!(config.stats_interval, Duration::from_secs(1));
        assert_eq!(config.report_interval, Duration::from_secs(5));
        assert_eq!(config.quota_refresh_interval, Duration::from_secs(30));
        assert_eq!(config.warning_thresholds, vec![80, 90, 95]);
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn test_delay_policy_falls_back_to_retry_delay() {
        let policy = ReconnectPolicy {
            max_attempts: 4,
            retry_delay: Duration::from_secs(9),
            delays: vec![Duration::from_secs(1), Duration::from_secs(3)],
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for(3), Duration::from_secs(9));
        assert_eq!(policy.delay_for(0), Duration::from_secs(9));
    }

    #[test]
    fn test_from_json_uses_milliseconds_and_defaults() {
        let config = tokio_test::assert_ok!(GridConfig::from_json(
            r#"{"p2p_timeout": 2500, "reconnect": {"max_attempts": 3, "delays": [100, 200]}}"#,
        ));
        assert_eq!(config.p2p_timeout, Duration::from_millis(2500));
        assert_eq!(config.stun_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.retry_delay, Duration::from_secs(2));
        assert_eq!(config.reconnect.delay_for(2), Duration::from_millis(200));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = tokio_test::assert_err!(GridConfig::from_json("{not json"));
        assert_eq!(err.error_code(), "INVALID_MESSAGE");
    }

    #[test]
    fn test_mobile_preset() {
        let config = GridConfig::mobile();
        assert_eq!(config.tier_timeouts().turn, Duration::from_secs(30));
        assert_eq!(config.reconnect.delay_for(4), Duration::from_secs(8));
        assert_eq!(config.reconnect.delay_for(5), Duration::from_secs(16));
        assert_eq!(config.warning_thresholds, vec![80, 90, 95]);
    }
}
