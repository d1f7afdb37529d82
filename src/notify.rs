use std::sync::Mutex;

use crate::types::Severity;

/// User-visible failure reporting. Fire-and-forget; must not block.
pub trait Notifier: Send + Sync {
    fn notify_user(&self, title: &str, message: &str, severity: Severity);
}

/// Routes notifications into the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify_user(&self, title: &str, message: &str, severity: Severity) {
        match severity {
            Severity::Info => tracing::info!("{title}: {message}"),
            Severity::Warning => tracing::warn!("{title}: {message}"),
            Severity::Error => tracing::error!("{title}: {message}"),
        }
    }
}

/// Keeps every notification, for hosts that render them later and for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<(String, String, Severity)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(String, String, Severity)> {
        std::mem::take(&mut *self.seen.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Notifier for RecordingNotifier {
    fn notify_user(&self, title: &str, message: &str, severity: Severity) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((title.to_string(), message.to_string(), severity));
    }
}
