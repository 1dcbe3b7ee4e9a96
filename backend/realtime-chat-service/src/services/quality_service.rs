use crate::error::{AppError, AppResult};
use crate::metrics::QUALITY_DEGRADED;
use crate::models::{DeviceId, DeviceIdentity, QualityLabel, QualitySample, QualityThresholds};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Outcome of recording one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityReport {
    pub label: QualityLabel,
    pub previous: Option<QualityLabel>,
    /// True when the label just dropped into `poor`
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantQuality {
    pub user_id: Uuid,
    pub device_id: DeviceId,
    pub label: QualityLabel,
    pub samples: usize,
    pub avg_jitter_ms: f64,
    pub avg_packet_loss_pct: f64,
    pub avg_rtt_ms: f64,
    pub avg_bandwidth_kbps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallQuality {
    pub call_id: Uuid,
    /// Worst participant label, `None` before any sample
    pub overall: Option<QualityLabel>,
    pub participants: Vec<ParticipantQuality>,
}

struct Window {
    samples: VecDeque<QualitySample>,
    label: QualityLabel,
}

impl Window {
    fn averages(&self) -> (f64, f64, f64, f64) {
        let n = self.samples.len().max(1) as f64;
        let sum = self.samples.iter().fold((0.0, 0.0, 0.0, 0.0), |acc, s| {
            (
                acc.0 + s.jitter_ms,
                acc.1 + s.packet_loss_pct,
                acc.2 + s.rtt_ms,
                acc.3 + s.bandwidth_kbps,
            )
        });
        (sum.0 / n, sum.1 / n, sum.2 / n, sum.3 / n)
    }
}

/// Rolling per-participant quality windows
///
/// Only the last `window` samples are kept per (call, device). The collector
/// never changes call state; it only reports label transitions.
#[derive(Clone)]
pub struct QualityService {
    window: usize,
    thresholds: QualityThresholds,
    windows: Arc<RwLock<HashMap<(Uuid, DeviceIdentity), Window>>>,
}

impl QualityService {
    pub fn new(window: usize, thresholds: QualityThresholds) -> Self {
        Self {
            window: window.max(1),
            thresholds,
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn record(
        &self,
        call_id: Uuid,
        identity: &DeviceIdentity,
        sample: QualitySample,
    ) -> AppResult<QualityReport> {
        if !sample.is_valid() {
            return Err(AppError::BadRequest("invalid quality sample".into()));
        }

        let mut windows = self.windows.write().await;
        let key = (call_id, identity.clone());
        let previous = windows.get(&key).map(|w| w.label);
        let window = windows.entry(key).or_insert_with(|| Window {
            samples: VecDeque::with_capacity(self.window),
            label: QualityLabel::Good,
        });

        window.samples.push_back(sample);
        while window.samples.len() > self.window {
            window.samples.pop_front();
        }
        let (jitter, loss, rtt, bandwidth) = window.averages();
        window.label = self.thresholds.classify(jitter, loss, rtt, bandwidth);

        let degraded =
            window.label == QualityLabel::Poor && previous.unwrap_or(QualityLabel::Good) != QualityLabel::Poor;
        if degraded {
            QUALITY_DEGRADED.inc();
            tracing::info!(
                call_id = %call_id,
                participant = %identity,
                jitter_ms = jitter,
                packet_loss_pct = loss,
                rtt_ms = rtt,
                "participant quality degraded"
            );
        }

        Ok(QualityReport {
            label: window.label,
            previous,
            degraded,
        })
    }

    pub async fn participant(&self, call_id: Uuid, identity: &DeviceIdentity) -> Option<ParticipantQuality> {
        let windows = self.windows.read().await;
        windows
            .get(&(call_id, identity.clone()))
            .map(|w| summarize(identity, w))
    }

    pub async fn call_summary(&self, call_id: Uuid) -> CallQuality {
        let windows = self.windows.read().await;
        let mut participants: Vec<ParticipantQuality> = windows
            .iter()
            .filter(|((call, _), _)| *call == call_id)
            .map(|((_, identity), w)| summarize(identity, w))
            .collect();
        participants.sort_by(|a, b| {
            (a.user_id, a.device_id.as_str()).cmp(&(b.user_id, b.device_id.as_str()))
        });

        CallQuality {
            call_id,
            overall: participants.iter().map(|p| p.label).max(),
            participants,
        }
    }

    pub async fn clear_call(&self, call_id: Uuid) {
        self.windows
            .write()
            .await
            .retain(|(call, _), _| *call != call_id);
    }

    pub async fn clear_participant(&self, call_id: Uuid, identity: &DeviceIdentity) {
        self.windows
            .write()
            .await
            .remove(&(call_id, identity.clone()));
    }
}

fn summarize(identity: &DeviceIdentity, window: &Window) -> ParticipantQuality {
    let (jitter, loss, rtt, bandwidth) = window.averages();
    ParticipantQuality {
        user_id: identity.user_id,
        device_id: identity.device_id.clone(),
        label: window.label,
        samples: window.samples.len(),
        avg_jitter_ms: jitter,
        avg_packet_loss_pct: loss,
        avg_rtt_ms: rtt,
        avg_bandwidth_kbps: bandwidth,
    }
}
