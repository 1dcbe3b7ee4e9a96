use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One connection-quality report from a call participant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
    pub rtt_ms: f64,
    pub bandwidth_kbps: f64,
    pub recorded_at: DateTime<Utc>,
}

impl QualitySample {
    pub fn is_valid(&self) -> bool {
        [
            self.jitter_ms,
            self.packet_loss_pct,
            self.rtt_ms,
            self.bandwidth_kbps,
        ]
        .iter()
        .all(|v| v.is_finite() && *v >= 0.0)
            && self.packet_loss_pct <= 100.0
    }
}

/// Worse labels compare greater
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLabel {
    Good,
    Fair,
    Poor,
}

impl QualityLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

/// Lower bounds at which a metric degrades the label
///
/// Bandwidth works the other way round: falling below the floor degrades.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    pub fair_jitter_ms: f64,
    pub poor_jitter_ms: f64,
    pub fair_loss_pct: f64,
    pub poor_loss_pct: f64,
    pub fair_rtt_ms: f64,
    pub poor_rtt_ms: f64,
    pub fair_bandwidth_kbps: f64,
    pub poor_bandwidth_kbps: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            fair_jitter_ms: 30.0,
            poor_jitter_ms: 60.0,
            fair_loss_pct: 2.0,
            poor_loss_pct: 8.0,
            fair_rtt_ms: 200.0,
            poor_rtt_ms: 400.0,
            fair_bandwidth_kbps: 300.0,
            poor_bandwidth_kbps: 100.0,
        }
    }
}

impl QualityThresholds {
    pub fn classify(
        &self,
        jitter_ms: f64,
        loss_pct: f64,
        rtt_ms: f64,
        bandwidth_kbps: f64,
    ) -> QualityLabel {
        if jitter_ms >= self.poor_jitter_ms
            || loss_pct >= self.poor_loss_pct
            || rtt_ms >= self.poor_rtt_ms
            || bandwidth_kbps < self.poor_bandwidth_kbps
        {
            QualityLabel::Poor
        } else if jitter_ms >= self.fair_jitter_ms
            || loss_pct >= self.fair_loss_pct
            || rtt_ms >= self.fair_rtt_ms
            || bandwidth_kbps < self.fair_bandwidth_kbps
        {
            QualityLabel::Fair
        } else {
            QualityLabel::Good
        }
    }
}
