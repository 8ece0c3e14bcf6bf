//! Operator alerts.
//!
//! Raised when something needs a human: retries exhausted on snapshot or
//! restore, a schedule item that failed to finalize, a prize that could not be
//! applied.

use crate::clock::now_millis;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::error;
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
#[cfg(feature = "metrics")]
use std::sync::Arc;

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCode {
    SnapshotFailed,
    RestoreFailed,
    FinalizeFailed,
    PrizeFailed,
    UnsupportedPrizeType,
    PublishFailed,
}

impl AlertCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCode::SnapshotFailed => "snapshot_failed",
            AlertCode::RestoreFailed => "restore_failed",
            AlertCode::FinalizeFailed => "finalize_failed",
            AlertCode::PrizeFailed => "prize_failed",
            AlertCode::UnsupportedPrizeType => "unsupported_prize_type",
            AlertCode::PublishFailed => "publish_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub code: AlertCode,
    /// Identifier of the thing that failed (leaderboard, schedule item, award).
    pub subject: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaderboard_id: Option<String>,
    pub created_at: i64,
}

impl Alert {
    pub fn new(code: AlertCode, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            code,
            subject: subject.into(),
            detail: detail.into(),
            leaderboard_id: None,
            created_at: now_millis(),
        }
    }

    pub fn with_leaderboard(mut self, leaderboard_id: impl Into<String>) -> Self {
        self.leaderboard_id = Some(leaderboard_id.into());
        self
    }
}

/// Where alerts go.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Writes alerts to the log at error level.
#[derive(Default)]
pub struct LogAlerts {
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl LogAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[cfg(feature = "metrics")]
    fn record_metric(&self, code: AlertCode) {
        if let Some(ref m) = self.metrics {
            m.alerts_total.with_label_values(&[code.as_str()]).inc();
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record_metric(&self, _code: AlertCode) {}
}

impl AlertSink for LogAlerts {
    fn raise(&self, alert: Alert) {
        self.record_metric(alert.code);
        error!(
            alert_id = %alert.id,
            code = alert.code.as_str(),
            subject = %alert.subject,
            leaderboard_id = alert.leaderboard_id.as_deref().unwrap_or(""),
            detail = %alert.detail,
            "Operator alert"
        );
    }
}

/// Callback invoked for every alert.
pub type AlertCallback = Box<dyn Fn(&Alert) + Send + Sync>;

/// Keeps the most recent alerts in memory.
pub struct MemoryAlerts {
    recent: Mutex<VecDeque<Alert>>,
    max: usize,
    callbacks: Mutex<Vec<AlertCallback>>,
}

impl MemoryAlerts {
    pub fn new() -> Self {
        Self::with_max(1000)
    }

    pub fn with_max(max: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::new()),
            max: max.max(1),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn on_alert(&self, callback: AlertCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn count(&self, code: AlertCode) -> usize {
        self.recent.lock().iter().filter(|a| a.code == code).count()
    }

    pub fn len(&self) -> usize {
        self.recent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.lock().is_empty()
    }
}

impl Default for MemoryAlerts {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertSink for MemoryAlerts {
    fn raise(&self, alert: Alert) {
        for callback in self.callbacks.lock().iter() {
            callback(&alert);
        }
        let mut recent = self.recent.lock();
        while recent.len() >= self.max {
            recent.pop_front();
        }
        recent.push_back(alert);
    }
}
