//! Structured logging setup

use gridlink_core::GridError;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Logging options
#[derive(Debug, Clone)]
pub struct DebugLogger {
    filter: String,
    with_target: bool,
}

impl DebugLogger {
    /// Logger with the default filter
    pub fn new() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            with_target: true,
        }
    }

    /// Use a filter directive instead of the default (still overridden by `RUST_LOG`)
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Whether to print the event target
    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }

    /// Install the global subscriber
    ///
    /// Returns `Ok(false)` when a subscriber was already installed.
    pub fn install(&self) -> Result<bool, GridError> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .map_err(|e| GridError::MissingConfiguration {
                field: format!("log filter '{}': {}", self.filter, e),
            })?;

        Ok(fmt()
            .with_env_filter(filter)
            .with_target(self.with_target)
            .try_init()
            .is_ok())
    }

    /// Initialize logging with defaults
    pub fn init_logging() -> Result<bool, GridError> {
        Self::new().install()
    }
}

impl Default for DebugLogger {
    fn default() -> Self {
        Self::new()
    }
}
