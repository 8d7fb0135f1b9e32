//! # Gridlink Media
//!
//! Media session and track bookkeeping for gridlink.
//! A media session nests under a data session: it owns the signaling router
//! for that session, tracks local and remote tracks, keeps the remote
//! participant count and writes the media fields of the data session.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod registry;
pub mod tracks;

// Re-export main types
pub use registry::{MediaSession, MediaSessionRegistry};
pub use tracks::{TrackAction, TrackEvent, TrackHistory, TrackOrigin, TRACK_HISTORY_LIMIT};
