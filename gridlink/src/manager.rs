//! Tiered connection management for one peer relationship
//!
//! A manager drives a single live connection at a time: pre-flight quota
//! admission, tier-ordered attempts, the stats sampler and usage reporter
//! while connected, and hand-over to the reconnection supervisor when the
//! transport is lost.

use crate::config::GridConfig;
use crate::event::{ConnectionEvent, EventFilter, EventStream, FilteredEventStream};
use crate::reconnect::ReconnectionSupervisor;
use dashmap::DashMap;
use gridlink_core::{
    BandwidthQuotaTracker, BillingClient, ConnectionMetrics, ConnectionState, ConnectionStats,
    ConnectionTier, GridError, PaymentIntent, PeerTransport, QuotaStatus, QuotaWarning, RelayMode,
    Session, SessionPatch, SessionRegistry, TierSelector, TransportConnector, UsageDelta,
};
use gridlink_diagnostics::ConnectionAnalyzer;
use gridlink_media::{MediaSession, MediaSessionRegistry};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

type Established = (ConnectionTier, Arc<dyn PeerTransport>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Connected,
    Reconnecting,
    /// Ended in a rest state; the session is kept until the next connect or disconnect
    Finished,
}

struct ActiveConnection {
    id: Uuid,
    grid_id: String,
    session_id: Option<String>,
    phase: Phase,
    cancel: CancellationToken,
    tracker: Arc<BandwidthQuotaTracker>,
    transport: Option<Arc<dyn PeerTransport>>,
    tasks: Vec<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl ActiveConnection {
    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

struct ManagerInner {
    peer_user_id: String,
    config: GridConfig,
    selector: TierSelector,
    connector: Arc<dyn TransportConnector>,
    billing: Arc<dyn BillingClient>,
    sessions: Arc<SessionRegistry>,
    media: Arc<MediaSessionRegistry>,
    trackers: DashMap<String, Arc<BandwidthQuotaTracker>>,
    events: broadcast::Sender<ConnectionEvent>,
    metrics: RwLock<ConnectionMetrics>,
    state: RwLock<ConnectionState>,
    stats: RwLock<Option<ConnectionStats>>,
    active: Mutex<Option<ActiveConnection>>,
}

/// Connection manager for one peer relationship
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct GridConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for GridConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridConnectionManager")
            .field("peer_user_id", &self.inner.peer_user_id)
            .field("state", &*self.inner.state.read())
            .finish()
    }
}

impl GridConnectionManager {
    /// Create a manager sharing the given registries
    pub fn new(
        peer_user_id: impl Into<String>,
        config: GridConfig,
        connector: Arc<dyn TransportConnector>,
        billing: Arc<dyn BillingClient>,
        sessions: Arc<SessionRegistry>,
        media: Arc<MediaSessionRegistry>,
    ) -> Self {
        let selector = TierSelector::new(config.stun_servers.clone(), config.tier_timeouts());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                peer_user_id: peer_user_id.into(),
                config,
                selector,
                connector,
                billing,
                sessions,
                media,
                trackers: DashMap::new(),
                events,
                metrics: RwLock::new(ConnectionMetrics::default()),
                state: RwLock::new(ConnectionState::Idle),
                stats: RwLock::new(None),
                active: Mutex::new(None),
            }),
        }
    }

    /// Remote user this manager connects to
    pub fn peer_user_id(&self) -> &str {
        &self.inner.peer_user_id
    }

    /// Connect to a grid
    ///
    /// The cached allocation is refreshed and checked before any transport is
    /// touched. Resolves once a tier connects or every allowed tier failed.
    pub async fn connect(&self, grid_id: &str) -> Result<Session, GridError> {
        let inner = &self.inner;
        let tracker = inner.tracker(grid_id);
        let cancel = CancellationToken::new();
        let connection_id = Uuid::new_v4();

        let stale = {
            let mut active = inner.active.lock();
            if let Some(current) = active.as_ref() {
                if current.phase != Phase::Finished {
                    return Err(GridError::InvalidState {
                        expected: "idle".to_string(),
                        actual: inner.state.read().to_string(),
                    });
                }
            }
            active.replace(ActiveConnection {
                id: connection_id,
                grid_id: grid_id.to_string(),
                session_id: None,
                phase: Phase::Connecting,
                cancel: cancel.clone(),
                tracker: tracker.clone(),
                transport: None,
                tasks: Vec::new(),
                supervisor: None,
            })
        };
        if let Some(stale) = stale {
            inner.release(stale).await;
        }

        info!("Connecting to grid {} for peer {}", grid_id, inner.peer_user_id);

        let status = tracker.refresh().await;
        if cancel.is_cancelled() {
            return Err(cancelled("connect"));
        }
        if let Err(e) = tracker.check_admission() {
            warn!(
                "Connect to grid {} rejected: {:.3}% of allocation used",
                grid_id, status.percent_used
            );
            if inner.take_if(connection_id).is_some() {
                inner.transition(
                    None,
                    Some(grid_id),
                    ConnectionState::QuotaExceeded,
                    SessionPatch::new(),
                );
            }
            return Err(e);
        }

        let session = inner.sessions.create(&inner.peer_user_id, grid_id);
        let session_id = session.session_id.clone();
        if !inner.attach_session(connection_id, &session_id) {
            inner.sessions.remove(&session_id);
            return Err(cancelled("connect"));
        }

        let relay = tracker.relay_config();
        let result = inner
            .selector
            .establish_with_fallback(
                inner.connector.as_ref(),
                grid_id,
                tracker.relay_mode(),
                relay.as_ref(),
                &cancel,
                &inner.metrics,
                |tier| {
                    inner.advance(
                        connection_id,
                        ConnectionState::attempting(tier),
                        SessionPatch::new(),
                        false,
                    );
                },
            )
            .await;

        match result {
            Ok((tier, transport)) => {
                if inner.install(connection_id, tier, transport.clone()).is_none() {
                    // Disconnected while the last attempt was completing.
                    if let Err(e) = transport.close().await {
                        debug!("Closing orphaned transport failed: {}", e);
                    }
                    return Err(cancelled("connect"));
                }
                inner
                    .sessions
                    .get(&session_id)
                    .ok_or(GridError::SessionNotFound { session_id })
            }
            Err(e @ GridError::Cancelled { .. }) => Err(e),
            Err(e) => {
                inner.advance(
                    connection_id,
                    ConnectionState::Failed,
                    SessionPatch::new().error(e.to_string()),
                    true,
                );
                Err(e)
            }
        }
    }

    /// Tear down the connection and return to idle; idempotent
    ///
    /// Cancels any in-flight attempt or pending reconnection, stops the
    /// timers, closes media before the transport and removes the session.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let taken = inner.active.lock().take();
        match taken {
            Some(active) => {
                let session_id = active.session_id.clone();
                let grid_id = active.grid_id.clone();
                info!("Disconnecting from grid {}", grid_id);
                inner.release(active).await;
                inner.transition(
                    session_id.as_deref(),
                    Some(&grid_id),
                    ConnectionState::Idle,
                    SessionPatch::new(),
                );
            }
            None => inner.transition(None, None, ConnectionState::Idle, SessionPatch::new()),
        }
    }

    /// Signal that the remote peer dropped; hands the session to the supervisor
    ///
    /// Returns false when there is no connected session to recover.
    pub fn handle_peer_disconnect(&self) -> bool {
        let connection_id = match self.inner.active.lock().as_ref() {
            Some(active) if active.phase == Phase::Connected => active.id,
            _ => return false,
        };
        self.inner
            .begin_reconnect(connection_id, "peer disconnected".to_string())
    }

    /// Current connection state
    pub fn get_state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Latest stats sample; `None` while no transport is active
    pub fn get_stats(&self) -> Option<ConnectionStats> {
        self.inner.stats.read().clone()
    }

    /// Session of the current connection
    pub fn session(&self) -> Option<Session> {
        let session_id = self.inner.active.lock().as_ref()?.session_id.clone()?;
        self.inner.sessions.get(&session_id)
    }

    /// Tier attempt counters
    pub fn metrics(&self) -> ConnectionMetrics {
        self.inner.metrics.read().clone()
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.inner.events.subscribe())
    }

    /// Subscribe to the events a filter selects
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventStream {
        FilteredEventStream::new(self.subscribe(), filter)
    }

    /// Open a media session for the current connection
    pub fn initialize_media(&self) -> Result<Arc<MediaSession>, GridError> {
        let session_id = self
            .inner
            .active
            .lock()
            .as_ref()
            .and_then(|a| a.session_id.clone())
            .ok_or_else(|| GridError::InvalidState {
                expected: "connected".to_string(),
                actual: self.get_state().to_string(),
            })?;
        self.inner.media.initialize(&session_id)
    }

    /// Quota status for a grid, refreshed when stale
    pub async fn quota_status(&self, grid_id: &str) -> QuotaStatus {
        self.inner.tracker(grid_id).refresh_if_stale().await
    }

    /// Buy relay bandwidth for a grid
    pub async fn purchase_bandwidth(
        &self,
        grid_id: &str,
        gb: u32,
        months: u32,
    ) -> Result<PaymentIntent, GridError> {
        self.inner.tracker(grid_id).purchase(gb, months).await
    }

    /// Change a grid's relay mode
    pub async fn update_relay_mode(&self, grid_id: &str, mode: RelayMode) -> Result<(), GridError> {
        self.inner.tracker(grid_id).update_relay_mode(mode).await
    }
}

impl ManagerInner {
    fn tracker(&self, grid_id: &str) -> Arc<BandwidthQuotaTracker> {
        self.trackers
            .entry(grid_id.to_string())
            .or_insert_with(|| {
                let tracker = Arc::new(BandwidthQuotaTracker::with_settings(
                    grid_id,
                    self.billing.clone(),
                    self.config.warning_thresholds.clone(),
                    self.config.quota_refresh_interval,
                ));
                spawn_warning_forwarder(tracker.subscribe(), self.events.clone());
                tracker
            })
            .clone()
    }

    /// Set the manager state, merge it into the session and announce changes
    fn transition(
        &self,
        session_id: Option<&str>,
        grid_id: Option<&str>,
        next: ConnectionState,
        extra: SessionPatch,
    ) {
        let previous = std::mem::replace(&mut *self.state.write(), next);

        if let Some(id) = session_id {
            if let Err(e) = self.sessions.update(id, extra.state(next)) {
                debug!("Session {} not updated to {}: {}", id, next, e);
            }
        }

        if previous != next {
            info!("Connection state {} -> {}", previous, next);
            let _ = self.events.send(ConnectionEvent::StateChanged {
                session_id: session_id.map(str::to_string),
                grid_id: grid_id.map(str::to_string),
                previous,
                state: next,
            });
        }
    }

    /// Transition only while the given connection is still the active one
    fn advance(
        &self,
        connection_id: Uuid,
        next: ConnectionState,
        extra: SessionPatch,
        finish: bool,
    ) -> bool {
        let mut guard = self.active.lock();
        let Some(active) = guard.as_mut().filter(|a| a.id == connection_id) else {
            return false;
        };
        if finish {
            active.phase = Phase::Finished;
        }
        self.transition(active.session_id.as_deref(), Some(&active.grid_id), next, extra);
        true
    }

    fn take_if(&self, connection_id: Uuid) -> Option<ActiveConnection> {
        let mut guard = self.active.lock();
        if guard.as_ref().map_or(false, |a| a.id == connection_id) {
            guard.take()
        } else {
            None
        }
    }

    fn attach_session(&self, connection_id: Uuid, session_id: &str) -> bool {
        match self.active.lock().as_mut() {
            Some(active) if active.id == connection_id => {
                active.session_id = Some(session_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Adopt a connected transport and start the timers
    fn install(
        self: &Arc<Self>,
        connection_id: Uuid,
        tier: ConnectionTier,
        transport: Arc<dyn PeerTransport>,
    ) -> Option<String> {
        let mut guard = self.active.lock();
        let active = guard.as_mut().filter(|a| {
            a.id == connection_id && matches!(a.phase, Phase::Connecting | Phase::Reconnecting)
        })?;
        let session_id = active.session_id.clone()?;

        active.phase = Phase::Connected;
        active.transport = Some(transport.clone());
        // Dropping the handle detaches; this may be the supervisor itself.
        active.supervisor = None;
        active.tasks = vec![
            self.spawn_sampler(&session_id, tier, transport.clone()),
            self.spawn_reporter(&active.grid_id, active.tracker.clone()),
            self.spawn_watcher(connection_id, transport),
        ];
        active.tracker.start_auto_refresh();

        self.transition(
            Some(&session_id),
            Some(&active.grid_id),
            ConnectionState::connected(tier),
            SessionPatch::new().clear_error(),
        );
        Some(session_id)
    }

    /// Release everything a connection holds
    async fn release(&self, mut active: ActiveConnection) {
        active.cancel.cancel();
        active.stop_tasks();
        if let Some(supervisor) = active.supervisor.take() {
            supervisor.abort();
        }
        active.tracker.stop_auto_refresh();
        *self.stats.write() = None;

        if let Some(session_id) = &active.session_id {
            self.media.close(session_id).await;
            self.sessions.remove(session_id);
            // Media opened between the first close and the removal
            self.media.close(session_id).await;
        }
        if let Some(transport) = active.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Closing transport for grid {} failed: {}", active.grid_id, e);
            }
        }
        debug!("Released connection {} to grid {}", active.id, active.grid_id);
    }

    /// Stop the timers of a lost connection and start supervised retries
    fn begin_reconnect(self: &Arc<Self>, connection_id: Uuid, reason: String) -> bool {
        let mut guard = self.active.lock();
        let Some(active) = guard
            .as_mut()
            .filter(|a| a.id == connection_id && a.phase == Phase::Connected)
        else {
            return false;
        };
        let Some(session_id) = active.session_id.clone() else {
            return false;
        };

        warn!("Connection to grid {} lost: {}", active.grid_id, reason);
        active.phase = Phase::Reconnecting;
        active.stop_tasks();
        let lost = active.transport.take();
        *self.stats.write() = None;

        self.transition(
            Some(&session_id),
            Some(&active.grid_id),
            ConnectionState::Reconnecting,
            SessionPatch::new().error(reason),
        );

        let supervisor = ReconnectionSupervisor::new(
            session_id,
            self.config.reconnect.clone(),
            self.sessions.clone(),
            self.events.clone(),
            active.cancel.clone(),
        );
        let weak = Arc::downgrade(self);
        active.supervisor = Some(tokio::spawn(async move {
            if let Some(transport) = lost {
                if let Err(e) = transport.close().await {
                    debug!("Closing lost transport failed: {}", e);
                }
            }

            let outcome = supervisor
                .run(|attempt| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(inner) => inner.retry(connection_id, attempt).await,
                            None => Err(cancelled("reconnect")),
                        }
                    }
                })
                .await;

            if let Some(inner) = weak.upgrade() {
                inner
                    .finish_reconnect(connection_id, supervisor.session_id(), outcome)
                    .await;
            }
        }));
        true
    }

    /// One supervised retry: quota check, then the full tier plan
    async fn retry(&self, connection_id: Uuid, attempt: u32) -> Result<Established, GridError> {
        let (grid_id, tracker, cancel) = {
            let guard = self.active.lock();
            let active = guard
                .as_ref()
                .filter(|a| a.id == connection_id && a.phase == Phase::Reconnecting)
                .ok_or_else(|| cancelled("reconnect"))?;
            (
                active.grid_id.clone(),
                active.tracker.clone(),
                active.cancel.clone(),
            )
        };

        debug!("Reconnect attempt {} for grid {}", attempt, grid_id);
        self.advance(
            connection_id,
            ConnectionState::Reconnecting,
            SessionPatch::new(),
            false,
        );

        tracker.refresh().await;
        tracker.check_admission()?;

        let relay = tracker.relay_config();
        self.selector
            .establish_with_fallback(
                self.connector.as_ref(),
                &grid_id,
                tracker.relay_mode(),
                relay.as_ref(),
                &cancel,
                &self.metrics,
                |tier| {
                    self.advance(
                        connection_id,
                        ConnectionState::attempting(tier),
                        SessionPatch::new(),
                        false,
                    );
                },
            )
            .await
    }

    async fn finish_reconnect(
        self: &Arc<Self>,
        connection_id: Uuid,
        session_id: &str,
        outcome: Result<(u32, Established), GridError>,
    ) {
        match outcome {
            Ok((attempt, (tier, transport))) => {
                if self.install(connection_id, tier, transport.clone()).is_some() {
                    let _ = self.events.send(ConnectionEvent::Reconnected {
                        session_id: session_id.to_string(),
                        attempt,
                        tier,
                    });
                } else if let Err(e) = transport.close().await {
                    debug!("Closing orphaned transport failed: {}", e);
                }
            }
            Err(GridError::Cancelled { .. }) => {}
            Err(e @ GridError::QuotaExceeded { .. }) => {
                self.advance(
                    connection_id,
                    ConnectionState::QuotaExceeded,
                    SessionPatch::new().error(e.to_string()),
                    true,
                );
            }
            Err(e) => {
                if self.advance(
                    connection_id,
                    ConnectionState::Failed,
                    SessionPatch::new().error(e.to_string()),
                    true,
                ) {
                    if let Some(mut active) = self.take_if(connection_id) {
                        // This task is the supervisor; let it finish instead of aborting it.
                        active.supervisor = None;
                        self.release(active).await;
                    }
                }
            }
        }
    }

    fn spawn_sampler(
        self: &Arc<Self>,
        session_id: &str,
        tier: ConnectionTier,
        transport: Arc<dyn PeerTransport>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let session_id = session_id.to_string();
        let period = self.config.stats_interval;

        tokio::spawn(async move {
            let mut analyzer = ConnectionAnalyzer::new();
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let mut stats = match transport.stats().await {
                    Ok(stats) => stats,
                    Err(e) => {
                        debug!("Stats sample for session {} failed: {}", session_id, e);
                        continue;
                    }
                };
                stats.connection_type.get_or_insert(tier);

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let quality = analyzer.sample(&stats);
                *inner.stats.write() = Some(stats.clone());
                if let Err(e) = inner
                    .sessions
                    .update(&session_id, SessionPatch::new().media_quality(quality))
                {
                    debug!("Quality not recorded for session {}: {}", session_id, e);
                }
                let _ = inner.events.send(ConnectionEvent::StatsUpdated {
                    session_id: session_id.clone(),
                    stats,
                    quality,
                });
            }
        })
    }

    fn spawn_reporter(
        self: &Arc<Self>,
        grid_id: &str,
        tracker: Arc<BandwidthQuotaTracker>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let grid_id = grid_id.to_string();
        let period = self.config.report_interval;

        tokio::spawn(async move {
            let mut reported = UsageDelta::default();
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(stats) = latest_stats(&weak) else {
                    continue;
                };
                let delta = stats.delta_since(&reported);
                if delta.is_empty() {
                    continue;
                }

                match tracker.report_usage(delta).await {
                    Ok(()) => {
                        reported = stats.usage_mark();
                        if let Some(inner) = weak.upgrade() {
                            let _ = inner.events.send(ConnectionEvent::UsageReported {
                                grid_id: grid_id.clone(),
                                delta,
                            });
                        }
                    }
                    Err(e) => warn!(
                        "Usage report for grid {} failed, retrying next tick: {}",
                        grid_id, e
                    ),
                }
            }
        })
    }

    fn spawn_watcher(
        self: &Arc<Self>,
        connection_id: Uuid,
        transport: Arc<dyn PeerTransport>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let mut states = transport.subscribe_state();

        tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                if state.is_lost() {
                    if let Some(inner) = weak.upgrade() {
                        inner.begin_reconnect(connection_id, format!("transport {:?}", state));
                    }
                    break;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.get_mut().take() {
            active.cancel.cancel();
            active.stop_tasks();
            if let Some(supervisor) = active.supervisor.take() {
                supervisor.abort();
            }
            active.tracker.stop_auto_refresh();
        }
    }
}

fn latest_stats(inner: &Weak<ManagerInner>) -> Option<ConnectionStats> {
    inner.upgrade()?.stats.read().clone()
}

fn spawn_warning_forwarder(
    mut warnings: broadcast::Receiver<QuotaWarning>,
    events: broadcast::Sender<ConnectionEvent>,
) {
    tokio::spawn(async move {
        loop {
            match warnings.recv().await {
                Ok(warning) => {
                    let _ = events.send(ConnectionEvent::QuotaWarning { warning });
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Dropped {} quota warnings", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn cancelled(operation: &str) -> GridError {
    GridError::Cancelled {
        operation: operation.to_string(),
    }
}
