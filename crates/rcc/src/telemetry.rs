//! Background metric submission.
//!
//! Metrics are handed to a [`MetricSink`] on the blocking pool so call sites
//! never wait on delivery. Every submission is tracked until
//! [`Telemetry::wait`] drains it, which the lifecycle does before exit.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;

/// Upper bound for draining pending submissions at shutdown.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    /// Who reports the metric (controller identity, e.g. `rcc.user`).
    pub kind: String,
    pub name: String,
    pub value: String,
}

/// Delivery of a single metric. Transport is up to the implementor.
pub trait MetricSink: Send + Sync {
    fn send(&self, metric: &Metric) -> anyhow::Result<()>;
}

/// Writes metrics to the log instead of a remote endpoint.
pub struct LogSink;

impl MetricSink for LogSink {
    fn send(&self, metric: &Metric) -> anyhow::Result<()> {
        debug!(
            "[telemetry] {} {} = {}",
            metric.kind, metric.name, metric.value
        );
        Ok(())
    }
}

pub struct Telemetry {
    sink: Arc<dyn MetricSink>,
    enabled: bool,
    timeout: Duration,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl Telemetry {
    /// `enabled` mirrors the user's tracking consent; when false every
    /// metric is dropped at the call site.
    pub fn new(sink: Arc<dyn MetricSink>, enabled: bool) -> Self {
        Self {
            sink,
            enabled,
            timeout: DEFAULT_WAIT_TIMEOUT,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Submit a metric without waiting for it. Must be called from within a
    /// tokio runtime.
    pub fn background_metric(&self, kind: &str, name: &str, value: &str) {
        if !self.enabled {
            debug!("[telemetry] Tracking not allowed, dropping {}", name);
            return;
        }
        let metric = Metric {
            kind: kind.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        };
        let sink = self.sink.clone();
        let handle = tokio::task::spawn_blocking(move || {
            if let Err(e) = sink.send(&metric) {
                warn!("[telemetry] Failed to send {}: {}", metric.name, e);
            }
        });
        self.lock_pending().push(handle);
    }

    /// Number of submissions not yet drained by [`Telemetry::wait`].
    pub fn pending(&self) -> usize {
        self.lock_pending().len()
    }

    /// Wait for every pending submission, giving up after the timeout.
    pub async fn wait(&self) {
        let handles: Vec<_> = self.lock_pending().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        debug!("[telemetry] Waiting for {} pending metrics", handles.len());
        let all = futures::future::join_all(handles);
        if tokio::time::timeout(self.timeout, all).await.is_err() {
            warn!(
                "[telemetry] Gave up waiting for metrics after {:?}",
                self.timeout
            );
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        // A poisoned list still holds valid handles.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
