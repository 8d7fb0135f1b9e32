//! # Gridlink Diagnostics
//!
//! Logging setup and connection quality analysis for gridlink.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod connection_analyzer;
pub mod debug_logger;

// Re-export main types
pub use connection_analyzer::{ConnectionAnalyzer, ConnectionReport, QualityThresholds};
pub use debug_logger::{DebugLogger, DEFAULT_LOG_FILTER};
