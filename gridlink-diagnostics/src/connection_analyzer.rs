//! Connection quality analysis from sampled transport stats

use gridlink_core::{ConnectionStats, ConnectionTier, GridError, MediaQuality};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Limits for each quality grade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityThresholds {
    /// Round-trip time below which quality is excellent
    pub excellent_rtt: Duration,
    /// Round-trip time below which quality is good
    pub good_rtt: Duration,
    /// Round-trip time below which quality is fair
    pub fair_rtt: Duration,
    /// Packets lost per sample tolerated for good quality
    pub good_loss: u64,
    /// Packets lost per sample tolerated for fair quality
    pub fair_loss: u64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent_rtt: Duration::from_millis(100),
            good_rtt: Duration::from_millis(200),
            fair_rtt: Duration::from_millis(400),
            good_loss: 5,
            fair_loss: 20,
        }
    }
}

/// Grades media quality from consecutive stats samples
#[derive(Debug)]
pub struct ConnectionAnalyzer {
    thresholds: QualityThresholds,
    started_at: Instant,
    last: Option<ConnectionStats>,
    last_quality: MediaQuality,
    samples: u64,
}

impl ConnectionAnalyzer {
    /// Analyzer with default thresholds
    pub fn new() -> Self {
        Self::with_thresholds(QualityThresholds::default())
    }

    /// Analyzer with custom thresholds
    pub fn with_thresholds(thresholds: QualityThresholds) -> Self {
        Self {
            thresholds,
            started_at: Instant::now(),
            last: None,
            last_quality: MediaQuality::Unknown,
            samples: 0,
        }
    }

    /// Feed one sample and grade it
    ///
    /// Loss is measured against the previous sample; the first sample with no
    /// round-trip time is `Unknown`.
    pub fn sample(&mut self, stats: &ConnectionStats) -> MediaQuality {
        let lost = match &self.last {
            Some(previous) => stats.packets_lost.saturating_sub(previous.packets_lost),
            None => 0,
        };

        let quality = match (stats.round_trip_time, &self.last) {
            (None, None) => MediaQuality::Unknown,
            (rtt, _) => self.grade(rtt, lost),
        };

        if quality != self.last_quality {
            debug!(
                "Media quality {:?} -> {:?} (rtt {:?}, {} lost)",
                self.last_quality, quality, stats.round_trip_time, lost
            );
        }
        self.last = Some(stats.clone());
        self.last_quality = quality;
        self.samples += 1;
        quality
    }

    /// Quality of the most recent sample
    pub fn quality(&self) -> MediaQuality {
        self.last_quality
    }

    /// Summary of the connection so far
    pub fn report(&self) -> ConnectionReport {
        let last = self.last.clone().unwrap_or_default();
        ConnectionReport {
            connection_type: last.connection_type,
            duration: self.started_at.elapsed(),
            round_trip_time: last.round_trip_time,
            bytes_sent: last.bytes_sent,
            bytes_received: last.bytes_received,
            packets_lost: last.packets_lost,
            quality: self.last_quality,
            samples: self.samples,
        }
    }

    fn grade(&self, rtt: Option<Duration>, lost: u64) -> MediaQuality {
        let t = &self.thresholds;
        let rtt_under = |limit: Duration| rtt.map_or(true, |rtt| rtt < limit);

        if rtt.is_some() && rtt_under(t.excellent_rtt) && lost == 0 {
            MediaQuality::Excellent
        } else if rtt_under(t.good_rtt) && lost <= t.good_loss {
            MediaQuality::Good
        } else if rtt_under(t.fair_rtt) && lost <= t.fair_loss {
            MediaQuality::Fair
        } else {
            MediaQuality::Poor
        }
    }
}

impl Default for ConnectionAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection summary for logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionReport {
    /// Tier the transport ran on
    pub connection_type: Option<ConnectionTier>,
    /// Time since the analyzer started
    pub duration: Duration,
    /// Last round-trip time
    pub round_trip_time: Option<Duration>,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Packets lost
    pub packets_lost: u64,
    /// Last quality grade
    pub quality: MediaQuality,
    /// Samples analyzed
    pub samples: u64,
}

impl ConnectionReport {
    /// Encode as JSON
    pub fn to_json(&self) -> Result<String, GridError> {
        serde_json::to_string(self).map_err(|e| GridError::InvalidMessage {
            message: "connection report".to_string(),
            source: e.into(),
        })
    }
}
