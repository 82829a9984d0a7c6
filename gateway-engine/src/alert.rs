//! Alert sink adapters.

use std::sync::Mutex;

use gateway_types::{Alert, AlertKind, AlertSink};

/// Emits alerts as `gateway::alert` error events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: Alert) {
        match alert.transaction_id {
            Some(id) => tracing::error!(
                target: "gateway::alert",
                kind = alert.kind.as_str(),
                transaction_id = %id,
                detail = %alert.detail,
                "Operator alert"
            ),
            None => tracing::error!(
                target: "gateway::alert",
                kind = alert.kind.as_str(),
                detail = %alert.detail,
                "Operator alert"
            ),
        }
    }
}

/// Keeps every alert in memory and forwards it to tracing.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .map(|alerts| alerts.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.alerts().iter().filter(|a| a.kind == kind).count()
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&self, alert: Alert) {
        TracingAlertSink.raise(alert.clone());
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
    }
}
