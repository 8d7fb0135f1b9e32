//! Reconnection supervision
//!
//! The supervisor owns the retry loop of one lost session: it schedules each
//! attempt with the policy's delay, publishes the countdown, and stops on
//! success, exhaustion, a quota rejection or cancellation. What an attempt
//! does is up to the caller.

use crate::config::ReconnectPolicy;
use crate::event::ConnectionEvent;
use gridlink_core::{GridError, SessionPatch, SessionRegistry};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives bounded retries for a lost session
#[derive(Debug)]
pub struct ReconnectionSupervisor {
    session_id: String,
    policy: ReconnectPolicy,
    sessions: Arc<SessionRegistry>,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
}

impl ReconnectionSupervisor {
    /// Create a supervisor for a session
    pub fn new(
        session_id: impl Into<String>,
        policy: ReconnectPolicy,
        sessions: Arc<SessionRegistry>,
        events: broadcast::Sender<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            policy,
            sessions,
            events,
            cancel,
        }
    }

    /// Session being supervised
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Token that aborts the pending retry
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run retries until one succeeds
    ///
    /// `retry` receives the 1-based attempt number. A `QuotaExceeded` or
    /// `Cancelled` result ends supervision immediately; other errors move on
    /// to the next attempt. Returns the successful attempt number with its
    /// value, or `ReconnectionExhausted` once every attempt failed.
    pub async fn run<T, F, Fut>(&self, mut retry: F) -> Result<(u32, T), GridError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GridError>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut last_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            let delay = self.policy.delay_for(attempt);
            self.patch(SessionPatch::new().reconnect_attempt(attempt));
            let _ = self.events.send(ConnectionEvent::Reconnecting {
                session_id: self.session_id.clone(),
                attempt,
                max_attempts,
                retry_in: delay,
            });
            info!(
                "Reconnecting session {} (attempt {}/{}) in {:?}",
                self.session_id, attempt, max_attempts, delay
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                result = retry(attempt) => result,
            };

            match result {
                Ok(value) => {
                    self.patch(SessionPatch::new().reconnect_attempt(0).clear_error());
                    info!(
                        "Session {} restored on attempt {}",
                        self.session_id, attempt
                    );
                    return Ok((attempt, value));
                }
                Err(e @ GridError::QuotaExceeded { .. }) | Err(e @ GridError::Cancelled { .. }) => {
                    warn!("Reconnection of session {} stopped: {}", self.session_id, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Reconnection attempt {}/{} for session {} failed: {}",
                        attempt, max_attempts, self.session_id, e
                    );
                    self.patch(SessionPatch::new().error(e.to_string()));
                    last_error = Some(e.to_string());
                }
            }
        }

        let err = GridError::ReconnectionExhausted {
            session_id: self.session_id.clone(),
            attempts: max_attempts,
        };
        let _ = self.events.send(ConnectionEvent::ReconnectionFailed {
            session_id: self.session_id.clone(),
            attempts: max_attempts,
            error: last_error.unwrap_or_else(|| err.to_string()),
        });
        warn!("{}", err);
        Err(err)
    }

    fn patch(&self, patch: SessionPatch) {
        if let Err(e) = self.sessions.update(&self.session_id, patch) {
            debug!("Skipping reconnect bookkeeping for {}: {}", self.session_id, e);
        }
    }

    fn cancelled(&self) -> GridError {
        debug!("Reconnection of session {} cancelled", self.session_id);
        GridError::Cancelled {
            operation: format!("reconnection of session {}", self.session_id),
        }
    }
}
