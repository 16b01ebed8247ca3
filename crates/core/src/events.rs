//! Event reporting. Recording is best-effort: it never blocks and never fails the
//! operation that produced the event.

#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Severity {
    Normal,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "Normal",
            Severity::Warning => "Warning",
        }
    }
}

pub mod reason {
    pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
    pub const FAILED_CREATE: &str = "FailedCreate";
    pub const SUCCESSFUL_UPDATE: &str = "SuccessfulUpdate";
    pub const FAILED_UPDATE: &str = "FailedUpdate";
    pub const SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
    pub const FAILED_DELETE: &str = "FailedDelete";
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub involved: ObjectReference,
    pub severity: Severity,
    pub reason: String,
    pub message: String,
}

pub trait EventRecorder: Send + Sync {
    fn record(&self, involved: &ObjectReference, severity: Severity, reason: &str, message: String);
}

pub struct NoopRecorder;

impl EventRecorder for NoopRecorder {
    fn record(&self, _involved: &ObjectReference, _severity: Severity, _reason: &str, _message: String) {}
}

/// Emits each event as a structured log line.
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, involved: &ObjectReference, severity: Severity, reason: &str, message: String) {
        let object = involved.name.as_deref().unwrap_or("-");
        let ns = involved.namespace.as_deref().unwrap_or("-");
        match severity {
            Severity::Normal => info!(ns = %ns, object = %object, reason = %reason, "{}", message),
            Severity::Warning => warn!(ns = %ns, object = %object, reason = %reason, "{}", message),
        }
    }
}

/// Forwards events into an unbounded channel; a dropped receiver is ignored.
#[derive(Clone)]
pub struct ChannelRecorder {
    tx: mpsc::UnboundedSender<RecordedEvent>,
}

impl ChannelRecorder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RecordedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventRecorder for ChannelRecorder {
    fn record(&self, involved: &ObjectReference, severity: Severity, reason: &str, message: String) {
        let _ = self.tx.send(RecordedEvent { involved: involved.clone(), severity, reason: reason.to_string(), message });
    }
}

/// Take everything currently queued without waiting.
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<RecordedEvent>) -> Vec<RecordedEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_recorder_queues_in_order() {
        let (rec, mut rx) = ChannelRecorder::new();
        let obj = ObjectReference { name: Some("foo".into()), ..Default::default() };
        rec.record(&obj, Severity::Normal, reason::SUCCESSFUL_CREATE, "a".into());
        rec.record(&obj, Severity::Warning, reason::FAILED_CREATE, "b".into());
        let evs = drain_events(&mut rx);
        assert_eq!(evs.len(), 2);
        assert_eq!(evs[0].severity, Severity::Normal);
        assert_eq!(evs[1].reason, "FailedCreate");
        assert!(drain_events(&mut rx).is_empty());
    }

    #[test]
    fn closed_channel_does_not_panic() {
        let (rec, rx) = ChannelRecorder::new();
        drop(rx);
        rec.record(&ObjectReference::default(), Severity::Warning, reason::FAILED_DELETE, "gone".into());
    }
}
