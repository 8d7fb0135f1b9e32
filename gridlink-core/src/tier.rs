//! Tier ordering and timed connection attempts

use crate::error::GridError;
use crate::quota::RelayConfig;
use crate::transport::{
    ConnectionMetrics, ConnectionTier, IceServer, PeerTransport, RelayMode, TransportConfig,
    TransportConnector, TransportPolicy,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-tier negotiation timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierTimeouts {
    /// Direct attempt timeout
    pub p2p: Duration,
    /// Reflection-assisted attempt timeout
    pub stun: Duration,
    /// Relayed attempt timeout
    pub turn: Duration,
}

impl Default for TierTimeouts {
    fn default() -> Self {
        Self {
            p2p: Duration::from_secs(10),
            stun: Duration::from_secs(10),
            // Relay negotiation is slower and is the last resort.
            turn: Duration::from_secs(20),
        }
    }
}

impl TierTimeouts {
    /// Timeout for one tier
    pub fn for_tier(&self, tier: ConnectionTier) -> Duration {
        match tier {
            ConnectionTier::P2p => self.p2p,
            ConnectionTier::Stun => self.stun,
            ConnectionTier::Turn => self.turn,
        }
    }
}

/// Orders tiers from the grid's relay mode and builds per-tier transport configs
#[derive(Debug, Clone)]
pub struct TierSelector {
    stun_servers: Vec<String>,
    timeouts: TierTimeouts,
}

impl TierSelector {
    /// Create a selector
    pub fn new(stun_servers: Vec<String>, timeouts: TierTimeouts) -> Self {
        Self {
            stun_servers,
            timeouts,
        }
    }

    /// Tier order for a relay mode
    pub fn plan(mode: RelayMode) -> Vec<ConnectionTier> {
        match mode {
            RelayMode::P2pFirst => vec![
                ConnectionTier::P2p,
                ConnectionTier::Stun,
                ConnectionTier::Turn,
            ],
            RelayMode::P2pOnly => vec![ConnectionTier::P2p],
            RelayMode::RelayOnly => vec![ConnectionTier::Turn],
        }
    }

    /// Timeouts in use
    pub fn timeouts(&self) -> TierTimeouts {
        self.timeouts
    }

    /// Build the transport configuration for one tier
    pub fn build_config(
        &self,
        grid_id: &str,
        tier: ConnectionTier,
        relay: Option<&RelayConfig>,
    ) -> Result<TransportConfig, GridError> {
        match tier {
            ConnectionTier::P2p => Ok(TransportConfig {
                tier,
                ice_servers: Vec::new(),
                policy: TransportPolicy::All,
            }),
            ConnectionTier::Stun => Ok(TransportConfig {
                tier,
                ice_servers: if self.stun_servers.is_empty() {
                    Vec::new()
                } else {
                    vec![IceServer::new(self.stun_servers.clone())]
                },
                policy: TransportPolicy::All,
            }),
            ConnectionTier::Turn => {
                let unavailable = |reason: &str| GridError::RelayUnavailable {
                    grid_id: grid_id.to_string(),
                    reason: reason.to_string(),
                };
                let relay = relay.ok_or_else(|| unavailable("relay is not configured"))?;
                let credentials = relay
                    .turn_credentials
                    .as_ref()
                    .ok_or_else(|| unavailable("no TURN credentials issued"))?;
                let urls: Vec<String> = relay
                    .healthy_servers()
                    .flat_map(|s| s.urls.iter().cloned())
                    .collect();
                if urls.is_empty() {
                    return Err(unavailable("no healthy relay servers"));
                }
                Ok(TransportConfig {
                    tier,
                    ice_servers: vec![IceServer {
                        urls,
                        username: Some(credentials.username.clone()),
                        credential: Some(credentials.credential.clone()),
                    }],
                    policy: TransportPolicy::RelayOnly,
                })
            }
        }
    }

    /// Attempt each tier of the plan in order until one connects
    ///
    /// `on_attempt` runs synchronously before each tier starts. Tier timeouts
    /// and failures are absorbed; only exhaustion of the whole plan, a relay
    /// that cannot be built for `relay_only`, or cancellation reach the caller.
    pub async fn establish_with_fallback<F>(
        &self,
        connector: &dyn TransportConnector,
        grid_id: &str,
        mode: RelayMode,
        relay: Option<&RelayConfig>,
        cancel: &CancellationToken,
        metrics: &parking_lot::RwLock<ConnectionMetrics>,
        mut on_attempt: F,
    ) -> Result<(ConnectionTier, Arc<dyn PeerTransport>), GridError>
    where
        F: FnMut(ConnectionTier),
    {
        let plan = Self::plan(mode);
        let mut attempted = Vec::with_capacity(plan.len());
        let mut last_error: Option<GridError> = None;

        info!(
            "Connecting grid {} with {} plan {:?}",
            grid_id, mode, plan
        );

        for tier in plan {
            let config = match self.build_config(grid_id, tier, relay) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Skipping {} tier for grid {}: {}", tier, grid_id, e);
                    last_error = Some(e);
                    continue;
                }
            };

            on_attempt(tier);
            attempted.push(tier);
            metrics.write().record_attempt();

            let mut attempt = ConnectionAttempt::new(grid_id, tier, self.timeouts.for_tier(tier));
            match attempt.run(connector, config, cancel).await {
                Ok(transport) => {
                    metrics.write().successful_connections += 1;
                    info!(
                        "Connected grid {} over {} after {:?}",
                        grid_id,
                        tier,
                        attempt.elapsed()
                    );
                    return Ok((tier, transport));
                }
                Err(e @ GridError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    let timed_out = matches!(e, GridError::AttemptTimeout { .. });
                    metrics.write().record_failure(tier, timed_out);
                    warn!("{} attempt for grid {} failed: {}", tier, grid_id, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e @ GridError::RelayUnavailable { .. }) if attempted.is_empty() => Err(e),
            last => Err(GridError::AllTiersFailed {
                grid_id: grid_id.to_string(),
                attempted,
                last_reason: last
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no tier could be attempted".to_string()),
                retry_in: Some(Duration::from_secs(5)),
            }),
        }
    }
}

/// One timed negotiation try at a given tier
#[derive(Debug)]
pub struct ConnectionAttempt {
    id: Uuid,
    grid_id: String,
    tier: ConnectionTier,
    timeout: Duration,
    started_at: Option<Instant>,
}

impl ConnectionAttempt {
    /// Create an attempt
    pub fn new(grid_id: &str, tier: ConnectionTier, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            grid_id: grid_id.to_string(),
            tier,
            timeout,
            started_at: None,
        }
    }

    /// Attempt ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Tier being attempted
    pub fn tier(&self) -> ConnectionTier {
        self.tier
    }

    /// Time since the attempt started
    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Run the negotiation, aborting it on timeout or cancellation
    pub async fn run(
        &mut self,
        connector: &dyn TransportConnector,
        config: TransportConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn PeerTransport>, GridError> {
        self.started_at = Some(Instant::now());
        debug!(
            "Attempt {} starting {} for grid {} (timeout {:?})",
            self.id, self.tier, self.grid_id, self.timeout
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GridError::Cancelled {
                operation: format!("{} attempt", self.tier),
            }),
            result = tokio::time::timeout(self.timeout, connector.establish(&self.grid_id, config)) => {
                match result {
                    Ok(Ok(transport)) => Ok(transport),
                    Ok(Err(e @ GridError::AttemptFailed { .. })) => Err(e),
                    Ok(Err(e)) => Err(GridError::AttemptFailed {
                        tier: self.tier,
                        reason: e.to_string(),
                    }),
                    Err(_) => Err(GridError::AttemptTimeout {
                        tier: self.tier,
                        timeout: self.timeout,
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{RelayServer, TurnCredentials};

    fn relay_config(healthy: bool) -> RelayConfig {
        RelayConfig {
            relay_mode: RelayMode::P2pFirst,
            allocation: None,
            turn_credentials: Some(TurnCredentials {
                username: "user".to_string(),
                credential: "pass".to_string(),
            }),
            relay_servers: vec![
                RelayServer {
                    region: "eu".to_string(),
                    urls: vec!["turn:eu.example.net:3478".to_string()],
                    is_healthy: healthy,
                },
                RelayServer {
                    region: "us".to_string(),
                    urls: vec!["turn:us.example.net:3478".to_string()],
                    is_healthy: false,
                },
            ],
        }
    }

    #[test]
    fn test_plans() {
        assert_eq!(
            TierSelector::plan(RelayMode::P2pFirst),
            vec![ConnectionTier::P2p, ConnectionTier::Stun, ConnectionTier::Turn]
        );
        assert_eq!(TierSelector::plan(RelayMode::P2pOnly), vec![ConnectionTier::P2p]);
        assert_eq!(TierSelector::plan(RelayMode::RelayOnly), vec![ConnectionTier::Turn]);
    }

    #[test]
    fn test_default_timeouts() {
        let timeouts = TierTimeouts::default();
        assert_eq!(timeouts.for_tier(ConnectionTier::P2p), Duration::from_secs(10));
        assert_eq!(timeouts.for_tier(ConnectionTier::Stun), Duration::from_secs(10));
        assert_eq!(timeouts.for_tier(ConnectionTier::Turn), Duration::from_secs(20));
    }

    #[test]
    fn test_turn_config_uses_only_healthy_servers() {
        let selector = TierSelector::new(vec![], TierTimeouts::default());
        let config = selector
            .build_config("g1", ConnectionTier::Turn, Some(&relay_config(true)))
            .unwrap();

        assert_eq!(config.policy, TransportPolicy::RelayOnly);
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec!["turn:eu.example.net:3478"]);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("user"));
    }

    #[test]
    fn test_turn_config_without_healthy_servers_is_unavailable() {
        let selector = TierSelector::new(vec![], TierTimeouts::default());
        let err = selector
            .build_config("g1", ConnectionTier::Turn, Some(&relay_config(false)))
            .unwrap_err();
        assert_eq!(err.error_code(), "RELAY_UNAVAILABLE");

        let err = selector
            .build_config("g1", ConnectionTier::Turn, None)
            .unwrap_err();
        assert_eq!(err.error_code(), "RELAY_UNAVAILABLE");
    }

    #[test]
    fn test_direct_tiers_allow_all_candidates() {
        let selector = TierSelector::new(
            vec!["stun:stun.example.net:19302".to_string()],
            TierTimeouts::default(),
        );
        let p2p = selector.build_config("g1", ConnectionTier::P2p, None).unwrap();
        assert!(p2p.ice_servers.is_empty());
        assert_eq!(p2p.policy, TransportPolicy::All);

        let stun = selector.build_config("g1", ConnectionTier::Stun, None).unwrap();
        assert_eq!(stun.ice_servers[0].urls, vec!["stun:stun.example.net:19302"]);
        assert_eq!(stun.policy, TransportPolicy::All);
    }
}
