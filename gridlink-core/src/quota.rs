//! Relay bandwidth quota tracking
//!
//! The tracker caches the relay configuration of one grid, derives usage
//! figures from it, issues threshold warnings and gates new connections.

use crate::error::GridError;
use crate::transport::{RelayMode, UsageDelta};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Default refresh period for the cached allocation
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Default warning thresholds (percent of purchased bandwidth)
pub const DEFAULT_WARNING_THRESHOLDS: [u8; 3] = [80, 90, 95];

const BYTES_PER_GB: f64 = 1_000_000_000.0;

/// Allocation status as reported by billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    /// Allocation can be consumed
    Active,
    /// Purchased bandwidth is used up
    Exhausted,
    /// Allocation period ended
    Expired,
    /// Purchase not yet settled
    Pending,
}

/// A purchased, time-bounded relay bandwidth quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayAllocation {
    /// Purchased bandwidth in GB
    pub purchased_gb: f64,
    /// Consumed bandwidth in GB
    pub used_gb: f64,
    /// End of the allocation period
    pub expires_at: DateTime<Utc>,
    /// Billing status
    pub status: AllocationStatus,
}

/// Relay server advertised by billing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayServer {
    /// Region label
    pub region: String,
    /// TURN URLs
    pub urls: Vec<String>,
    /// Health flag; unhealthy servers are never handed to the transport
    pub is_healthy: bool,
}

/// TURN credentials issued for a grid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredentials {
    /// TURN username
    pub username: String,
    /// TURN credential
    pub credential: String,
}

/// Relay configuration of a grid
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Tier policy of the grid
    #[serde(default)]
    pub relay_mode: RelayMode,
    /// Current allocation, if one was purchased
    #[serde(default)]
    pub allocation: Option<RelayAllocation>,
    /// TURN credentials, if relay is configured
    #[serde(default)]
    pub turn_credentials: Option<TurnCredentials>,
    /// Advertised relay servers
    #[serde(default)]
    pub relay_servers: Vec<RelayServer>,
}

impl RelayConfig {
    /// Relay servers that may be used
    pub fn healthy_servers(&self) -> impl Iterator<Item = &RelayServer> {
        self.relay_servers.iter().filter(|s| s.is_healthy)
    }
}

/// Payment intent returned by a bandwidth purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Intent ID
    pub id: String,
    /// Secret the payment UI confirms with
    pub client_secret: String,
    /// Amount in cents
    pub amount_cents: u64,
    /// ISO currency code
    pub currency: String,
}

/// Errors reported by the billing collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    /// Relay is not configured for the grid (404-class)
    #[error("Relay not configured")]
    NotConfigured,
    /// Request failed
    #[error("Billing request failed (status {status:?}): {reason}")]
    Request {
        /// HTTP-like status code, if any
        status: Option<u16>,
        /// Reason for failure
        reason: String,
    },
}

impl From<BillingError> for GridError {
    fn from(err: BillingError) -> Self {
        GridError::Billing {
            reason: err.to_string(),
        }
    }
}

/// Relay/billing collaborator
#[async_trait]
pub trait BillingClient: Send + Sync {
    /// Fetch the relay configuration of a grid
    async fn get_relay_config(&self, grid_id: &str) -> Result<RelayConfig, BillingError>;

    /// Report relay usage
    async fn report_usage(
        &self,
        grid_id: &str,
        bytes_sent: u64,
        bytes_received: u64,
    ) -> Result<(), BillingError>;

    /// Change the relay mode of a grid
    async fn update_relay_mode(&self, grid_id: &str, mode: RelayMode) -> Result<(), BillingError>;

    /// Start a bandwidth purchase
    async fn purchase_bandwidth(
        &self,
        grid_id: &str,
        gb: u32,
        months: u32,
    ) -> Result<PaymentIntent, BillingError>;
}

/// Threshold crossing notification
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaWarning {
    /// Grid the allocation belongs to
    pub grid_id: String,
    /// Threshold that was crossed (percent)
    pub threshold: u8,
    /// Percentage used when the crossing was observed
    pub percent_used: f64,
    /// Remaining bandwidth in GB
    pub remaining_gb: f64,
}

/// Derived view of the cached allocation
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaStatus {
    /// Whether relay is configured and an allocation exists
    pub has_allocation: bool,
    /// Percentage of purchased bandwidth used (0 without allocation)
    pub percent_used: f64,
    /// Remaining bandwidth in GB
    pub remaining_gb: f64,
    /// Allocation period has ended
    pub is_expired: bool,
    /// Allocation is used up
    pub is_quota_exceeded: bool,
    /// The user has to buy bandwidth before relaying
    pub needs_purchase: bool,
    /// Relay mode of the grid
    pub relay_mode: RelayMode,
    /// Raw allocation
    pub allocation: Option<RelayAllocation>,
}

impl QuotaStatus {
    /// Derive the status from a relay configuration at the given instant
    pub fn derive(config: Option<&RelayConfig>, now: DateTime<Utc>) -> Self {
        let relay_mode = config.map(|c| c.relay_mode).unwrap_or_default();
        let allocation = config.and_then(|c| c.allocation.clone());

        match &allocation {
            Some(a) => {
                let percent_used = if a.purchased_gb > 0.0 {
                    (a.used_gb / a.purchased_gb * 100.0).min(100.0)
                } else {
                    100.0
                };
                let is_expired = a.expires_at < now;
                let is_quota_exceeded =
                    a.status == AllocationStatus::Exhausted || a.used_gb >= a.purchased_gb;
                Self {
                    has_allocation: true,
                    percent_used,
                    remaining_gb: (a.purchased_gb - a.used_gb).max(0.0),
                    is_expired,
                    is_quota_exceeded,
                    needs_purchase: is_quota_exceeded || is_expired,
                    relay_mode,
                    allocation,
                }
            }
            None => Self {
                has_allocation: false,
                percent_used: 0.0,
                remaining_gb: 0.0,
                is_expired: false,
                is_quota_exceeded: false,
                needs_purchase: true,
                relay_mode,
                allocation: None,
            },
        }
    }
}

#[derive(Debug, Default)]
struct QuotaCache {
    config: Option<RelayConfig>,
    fetched_at: Option<Instant>,
    last_error: Option<String>,
    /// Highest threshold already announced for the current usage level
    fired_threshold: Option<u8>,
}

/// Caches a grid's relay allocation and gates connections on it
pub struct BandwidthQuotaTracker {
    grid_id: String,
    billing: Arc<dyn BillingClient>,
    cache: Arc<RwLock<QuotaCache>>,
    thresholds: Vec<u8>,
    refresh_interval: Duration,
    warning_tx: broadcast::Sender<QuotaWarning>,
    ready_tx: watch::Sender<bool>,
    refresh_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BandwidthQuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthQuotaTracker")
            .field("grid_id", &self.grid_id)
            .field("cache", &self.cache)
            .field("thresholds", &self.thresholds)
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

impl BandwidthQuotaTracker {
    /// Create a tracker with the default 30s refresh and 80/90/95% thresholds
    pub fn new(grid_id: impl Into<String>, billing: Arc<dyn BillingClient>) -> Self {
        Self::with_settings(
            grid_id,
            billing,
            DEFAULT_WARNING_THRESHOLDS.to_vec(),
            DEFAULT_REFRESH_INTERVAL,
        )
    }

    /// Create a tracker with explicit thresholds and refresh period
    pub fn with_settings(
        grid_id: impl Into<String>,
        billing: Arc<dyn BillingClient>,
        mut thresholds: Vec<u8>,
        refresh_interval: Duration,
    ) -> Self {
        thresholds.sort_unstable();
        thresholds.dedup();
        let (warning_tx, _) = broadcast::channel(32);
        let (ready_tx, _) = watch::channel(false);
        Self {
            grid_id: grid_id.into(),
            billing,
            cache: Arc::new(RwLock::new(QuotaCache::default())),
            thresholds,
            refresh_interval,
            warning_tx,
            ready_tx,
            refresh_handle: parking_lot::Mutex::new(None),
        }
    }

    /// Grid this tracker belongs to
    pub fn grid_id(&self) -> &str {
        &self.grid_id
    }

    /// Subscribe to threshold warnings
    pub fn subscribe(&self) -> broadcast::Receiver<QuotaWarning> {
        self.warning_tx.subscribe()
    }

    /// Resolves once the first fetch (successful or not) has completed
    pub async fn ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        // Sender lives in self, so wait_for only fails if self is gone.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Fetch the relay configuration and update the cache
    ///
    /// Never fails. "Not configured" leaves the tracker without an allocation.
    /// A fetch error records `last_error` and keeps the cached allocation, or
    /// leaves none when nothing was fetched yet.
    pub async fn refresh(&self) -> QuotaStatus {
        let result = self.billing.get_relay_config(&self.grid_id).await;

        let warnings = {
            let mut cache = self.cache.write();
            match result {
                Ok(mut config) => {
                    if let (Some(previous), Some(fresh)) = (
                        cache.config.as_ref().and_then(|c| c.allocation.as_ref()),
                        config.allocation.as_mut(),
                    ) {
                        // Same period: usage never goes backwards.
                        if previous.expires_at == fresh.expires_at && fresh.used_gb < previous.used_gb
                        {
                            debug!(
                                "Clamping stale used_gb {} to {} for grid {}",
                                fresh.used_gb, previous.used_gb, self.grid_id
                            );
                            fresh.used_gb = previous.used_gb;
                        }
                    }
                    cache.config = Some(config);
                    cache.last_error = None;
                }
                Err(BillingError::NotConfigured) => {
                    debug!("Relay not configured for grid {}", self.grid_id);
                    cache.config = None;
                    cache.last_error = None;
                }
                Err(e) => {
                    let err = GridError::AllocationFetchFailed {
                        grid_id: self.grid_id.clone(),
                        reason: e.to_string(),
                    };
                    if cache.config.is_some() {
                        warn!("{}; keeping cached allocation", err);
                    } else {
                        warn!("{}; continuing without allocation", err);
                    }
                    cache.last_error = Some(err.to_string());
                }
            }
            cache.fetched_at = Some(Instant::now());

            let status = QuotaStatus::derive(cache.config.as_ref(), Utc::now());
            self.evaluate_thresholds(&mut cache, &status)
        };

        self.ready_tx.send_replace(true);
        for warning in warnings {
            info!(
                "Relay usage for grid {} crossed {}% ({:.3}% used)",
                warning.grid_id, warning.threshold, warning.percent_used
            );
            let _ = self.warning_tx.send(warning);
        }

        self.status()
    }

    /// Refresh only if the cache is older than the refresh interval
    pub async fn refresh_if_stale(&self) -> QuotaStatus {
        if self.is_stale() {
            self.refresh().await
        } else {
            self.status()
        }
    }

    /// Whether the cache has never been filled or has aged out
    pub fn is_stale(&self) -> bool {
        match self.cache.read().fetched_at {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }

    /// Derived status of the cached allocation
    pub fn status(&self) -> QuotaStatus {
        QuotaStatus::derive(self.cache.read().config.as_ref(), Utc::now())
    }

    /// Cached relay configuration
    pub fn relay_config(&self) -> Option<RelayConfig> {
        self.cache.read().config.clone()
    }

    /// Relay mode of the grid (default when nothing is cached)
    pub fn relay_mode(&self) -> RelayMode {
        self.cache
            .read()
            .config
            .as_ref()
            .map(|c| c.relay_mode)
            .unwrap_or_default()
    }

    /// Error of the last failed fetch, if the last fetch failed
    pub fn last_error(&self) -> Option<String> {
        self.cache.read().last_error.clone()
    }

    /// Pre-flight admission check against the cached allocation
    pub fn check_admission(&self) -> Result<(), GridError> {
        let status = self.status();
        if status.has_allocation && status.is_quota_exceeded {
            return Err(GridError::QuotaExceeded {
                grid_id: self.grid_id.clone(),
                percent_used: status.percent_used,
            });
        }
        Ok(())
    }

    /// Report transferred bytes, then refresh the allocation
    pub async fn report_usage(&self, delta: UsageDelta) -> Result<(), GridError> {
        if delta.is_empty() {
            return Ok(());
        }
        self.billing
            .report_usage(&self.grid_id, delta.bytes_sent, delta.bytes_received)
            .await
            .map_err(GridError::from)?;
        debug!(
            "Reported {:.6} GB of usage for grid {}",
            delta.total_bytes() as f64 / BYTES_PER_GB,
            self.grid_id
        );
        self.refresh().await;
        Ok(())
    }

    /// Start a bandwidth purchase and refresh once billing has answered
    pub async fn purchase(&self, gb: u32, months: u32) -> Result<PaymentIntent, GridError> {
        let intent = self
            .billing
            .purchase_bandwidth(&self.grid_id, gb, months)
            .await
            .map_err(GridError::from)?;
        info!(
            "Created payment intent {} for {} GB over {} months on grid {}",
            intent.id, gb, months, self.grid_id
        );
        self.refresh().await;
        Ok(intent)
    }

    /// Change the relay mode and refresh the cached configuration
    pub async fn update_relay_mode(&self, mode: RelayMode) -> Result<(), GridError> {
        self.billing
            .update_relay_mode(&self.grid_id, mode)
            .await
            .map_err(GridError::from)?;
        info!("Relay mode for grid {} set to {}", self.grid_id, mode);
        self.refresh().await;
        Ok(())
    }

    /// Start the periodic refresh task
    pub fn start_auto_refresh(self: &Arc<Self>) {
        let mut handle = self.refresh_handle.lock();
        if handle.is_some() {
            return;
        }

        let tracker = Arc::downgrade(self);
        let period = self.refresh_interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            // First tick completes immediately; the cache was just filled.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                tracker.refresh().await;
            }
        }));
        debug!("Started quota refresh for grid {}", self.grid_id);
    }

    /// Stop the periodic refresh task
    pub fn stop_auto_refresh(&self) {
        if let Some(handle) = self.refresh_handle.lock().take() {
            handle.abort();
            debug!("Stopped quota refresh for grid {}", self.grid_id);
        }
    }

    fn evaluate_thresholds(&self, cache: &mut QuotaCache, status: &QuotaStatus) -> Vec<QuotaWarning> {
        if !status.has_allocation {
            cache.fired_threshold = None;
            return Vec::new();
        }

        let crossed = self
            .thresholds
            .iter()
            .copied()
            .filter(|t| status.percent_used >= f64::from(*t))
            .max();

        let warnings = match (crossed, cache.fired_threshold) {
            (Some(level), Some(fired)) if level <= fired => Vec::new(),
            (Some(level), _) => vec![QuotaWarning {
                grid_id: self.grid_id.clone(),
                threshold: level,
                percent_used: status.percent_used,
                remaining_gb: status.remaining_gb,
            }],
            (None, _) => Vec::new(),
        };

        // Re-arm thresholds that usage fell back below.
        cache.fired_threshold = crossed;
        warnings
    }
}

impl Drop for BandwidthQuotaTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh_handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedBilling {
        responses: Mutex<Vec<Result<RelayConfig, BillingError>>>,
        reports: Mutex<Vec<(u64, u64)>>,
    }

    impl ScriptedBilling {
        fn new(responses: Vec<Result<RelayConfig, BillingError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                reports: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BillingClient for ScriptedBilling {
        async fn get_relay_config(&self, _grid_id: &str) -> Result<RelayConfig, BillingError> {
            let mut responses = self.responses.lock();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses[0].clone()
            }
        }

        async fn report_usage(&self, _: &str, sent: u64, received: u64) -> Result<(), BillingError> {
            self.reports.lock().push((sent, received));
            Ok(())
        }

        async fn update_relay_mode(&self, _: &str, _: RelayMode) -> Result<(), BillingError> {
            Ok(())
        }

        async fn purchase_bandwidth(
            &self,
            _: &str,
            gb: u32,
            _: u32,
        ) -> Result<PaymentIntent, BillingError> {
            Ok(PaymentIntent {
                id: "pi_1".to_string(),
                client_secret: "secret".to_string(),
                amount_cents: u64::from(gb) * 100,
                currency: "usd".to_string(),
            })
        }
    }

    fn config_with(purchased: f64, used: f64) -> RelayConfig {
        RelayConfig {
            relay_mode: RelayMode::P2pFirst,
            allocation: Some(RelayAllocation {
                purchased_gb: purchased,
                used_gb: used,
                expires_at: Utc::now() + chrono::Duration::days(30),
                status: AllocationStatus::Active,
            }),
            turn_credentials: None,
            relay_servers: vec![],
        }
    }

    #[test]
    fn test_status_derivation() {
        let config = config_with(100.0, 25.0);
        let status = QuotaStatus::derive(Some(&config), Utc::now());
        assert!(status.has_allocation);
        assert!((status.percent_used - 25.0).abs() < f64::EPSILON);
        assert!((status.remaining_gb - 75.0).abs() < f64::EPSILON);
        assert!(!status.is_expired);
        assert!(!status.is_quota_exceeded);
        assert!(!status.needs_purchase);
    }

    #[test]
    fn test_status_exhausted_flag_wins_over_numbers() {
        let mut config = config_with(100.0, 10.0);
        if let Some(a) = config.allocation.as_mut() {
            a.status = AllocationStatus::Exhausted;
        }
        let status = QuotaStatus::derive(Some(&config), Utc::now());
        assert!(status.is_quota_exceeded);
        assert!(status.needs_purchase);
    }

    #[test]
    fn test_status_expired_needs_purchase() {
        let mut config = config_with(100.0, 10.0);
        if let Some(a) = config.allocation.as_mut() {
            a.expires_at = Utc::now() - chrono::Duration::hours(1);
        }
        let status = QuotaStatus::derive(Some(&config), Utc::now());
        assert!(status.is_expired);
        assert!(!status.is_quota_exceeded);
        assert!(status.needs_purchase);
    }

    #[tokio::test]
    async fn test_not_configured_is_not_an_error() {
        let billing = ScriptedBilling::new(vec![Err(BillingError::NotConfigured)]);
        let tracker = BandwidthQuotaTracker::new("grid-1", billing);

        let status = tracker.refresh().await;
        assert!(!status.has_allocation);
        assert!(status.needs_purchase);
        assert!(tracker.last_error().is_none());
        assert!(tracker.check_admission().is_ok());
    }

    #[tokio::test]
    async fn test_fetch_failure_treated_as_no_allocation() {
        let billing = ScriptedBilling::new(vec![Err(BillingError::Request {
            status: Some(503),
            reason: "unavailable".to_string(),
        })]);
        let tracker = BandwidthQuotaTracker::new("grid-1", billing);

        let status = tracker.refresh().await;
        assert!(!status.has_allocation);
        assert!(tracker.last_error().is_some());
        assert!(tracker.check_admission().is_ok());
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_cached_allocation() {
        let mut first = config_with(100.0, 96.0);
        first.relay_mode = RelayMode::RelayOnly;
        let mut lower = first.clone();
        if let Some(a) = lower.allocation.as_mut() {
            a.used_gb = 90.0;
        }
        let billing = ScriptedBilling::new(vec![
            Ok(first),
            Err(BillingError::Request {
                status: Some(503),
                reason: "unavailable".to_string(),
            }),
            Ok(lower),
        ]);
        let tracker = BandwidthQuotaTracker::new("grid-1", billing);
        let mut warnings = tracker.subscribe();

        tracker.refresh().await;
        let during = tracker.refresh().await;
        assert!(during.has_allocation);
        assert_eq!(during.relay_mode, RelayMode::RelayOnly);
        assert_eq!(tracker.relay_mode(), RelayMode::RelayOnly);
        assert!(tracker.last_error().is_some());

        let after = tracker.refresh().await;
        assert!((after.allocation.unwrap().used_gb - 96.0).abs() < f64::EPSILON);
        assert!(tracker.last_error().is_none());

        assert_eq!(warnings.try_recv().unwrap().threshold, 95);
        assert!(warnings.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_admission_rejects_full_allocation() {
        let billing = ScriptedBilling::new(vec![Ok(config_with(100.0, 100.0))]);
        let tracker = BandwidthQuotaTracker::new("grid-1", billing);
        tracker.refresh().await;

        match tracker.check_admission() {
            Err(GridError::QuotaExceeded { grid_id, .. }) => assert_eq!(grid_id, "grid-1"),
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_warning_fires_once_per_crossing() {
        let billing = ScriptedBilling::new(vec![
            Ok(config_with(100.0, 50.0)),
            Ok(config_with(100.0, 82.0)),
            Ok(config_with(100.0, 85.0)),
            Ok(config_with(100.0, 91.0)),
            Ok(config_with(100.0, 91.5)),
        ]);
        let tracker = BandwidthQuotaTracker::new("grid-1", billing);
        let mut warnings = tracker.subscribe();

        for _ in 0..5 {
            tracker.refresh().await;
        }

        assert_eq!(warnings.try_recv().unwrap().threshold, 80);
        assert_eq!(warnings.try_recv().unwrap().threshold, 90);
        assert!(warnings.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multi_threshold_jump_emits_highest_only() {
        let billing = ScriptedBilling::new(vec![Ok(config_with(100.0, 99.999))]);
        let tracker = BandwidthQuotaTracker::new("grid-1", billing);
        let mut warnings = tracker.subscribe();

        tracker.refresh().await;
        tracker.refresh().await;

        let warning = warnings.try_recv().unwrap();
        assert_eq!(warning.threshold, 95);
        assert!(warnings.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_threshold_rearms_after_purchase() {
        let billing = ScriptedBilling::new(vec![
            Ok(config_with(100.0, 96.0)),
            Ok(config_with(200.0, 96.0)),
            Ok(config_with(200.0, 190.0)),
        ]);
        let tracker = BandwidthQuotaTracker::new("grid-1", billing);
        let mut warnings = tracker.subscribe();

        tracker.refresh().await;
        tracker.purchase(100, 1).await.unwrap();
        tracker.refresh().await;

        assert_eq!(warnings.try_recv().unwrap().threshold, 95);
        assert_eq!(warnings.try_recv().unwrap().threshold, 95);
        assert!(warnings.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_used_gb_never_decreases_within_period() {
        let first = config_with(100.0, 40.0);
        let mut stale = first.clone();
        if let Some(a) = stale.allocation.as_mut() {
            a.used_gb = 30.0;
        }
        let billing = ScriptedBilling::new(vec![Ok(first), Ok(stale)]);
        let tracker = BandwidthQuotaTracker::new("grid-1", billing);

        tracker.refresh().await;
        let status = tracker.refresh().await;
        assert!((status.allocation.unwrap().used_gb - 40.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_ready_resolves_after_first_fetch() {
        let billing = ScriptedBilling::new(vec![Ok(config_with(10.0, 1.0))]);
        let tracker = Arc::new(BandwidthQuotaTracker::new("grid-1", billing));

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.ready().await })
        };
        tracker.refresh().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("ready should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_usage_is_not_reported() {
        let billing = ScriptedBilling::new(vec![Ok(config_with(10.0, 1.0))]);
        let tracker = BandwidthQuotaTracker::new("grid-1", billing.clone());

        tracker.report_usage(UsageDelta::default()).await.unwrap();
        tracker
            .report_usage(UsageDelta {
                bytes_sent: 10,
                bytes_received: 5,
            })
            .await
            .unwrap();

        assert_eq!(billing.reports.lock().as_slice(), &[(10, 5)]);
    }
}
