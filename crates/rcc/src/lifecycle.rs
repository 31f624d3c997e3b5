//! Process lifecycle: run a command, then flush and terminate.
//!
//! Every run goes `Running -> {completed, controlled exit, unexpected
//! failure} -> flushing -> exiting`. Whatever the outcome, pending telemetry
//! and log output are flushed before [`LifecycleGuard::conclude`] returns,
//! and only then does [`Termination::apply`] end the process.
//!
//! A controlled exit is a [`ControlledExit`] error carrying a user message
//! and an exit code. Any other error, and any panic, is unexpected: it is
//! reported as a metric, flushed, and then terminates the process (panics
//! are re-raised).

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use log::{debug, error, warn};
use rcc_env::Locations;

use crate::logging::flush_logs;
use crate::recycle;
use crate::telemetry::Telemetry;

/// Metric reported when a run ends with an unexpected failure.
pub const PANIC_ORIGIN_METRIC: &str = "rcc.panic.origin";

/// Expected, user-facing termination with a message and exit code.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ControlledExit {
    pub code: i32,
    pub message: String,
}

impl ControlledExit {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn show_message(&self) {
        if !self.message.is_empty() {
            eprintln!("{}", self.message);
        }
    }
}

/// Named milestones with the time elapsed since the run started.
pub struct Timeline {
    started: Instant,
    events: Mutex<Vec<(Duration, String)>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, event: impl Into<String>) {
        let elapsed = self.started.elapsed();
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((elapsed, event.into()));
    }

    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    fn dump(&self) {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        for (elapsed, event) in events.iter() {
            debug!("[timeline] {:>8.3}s {}", elapsed.as_secs_f64(), event);
        }
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by everything that takes part in one process run.
pub struct LifecycleContext {
    locations: Locations,
    controller: String,
    origin: String,
    started_at: i64,
    telemetry: Telemetry,
    timeline: Timeline,
    marked: AtomicBool,
}

impl LifecycleContext {
    /// `origin` names what is being run (the subcommand); it is what an
    /// unexpected failure gets reported against.
    pub fn new(
        locations: Locations,
        controller: impl Into<String>,
        origin: impl Into<String>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            locations,
            controller: controller.into(),
            origin: origin.into(),
            started_at: chrono::Utc::now().timestamp(),
            telemetry,
            timeline: Timeline::new(),
            marked: AtomicBool::new(false),
        }
    }

    pub fn locations(&self) -> &Locations {
        &self.locations
    }

    /// Metric kind for this run, e.g. `rcc.user`.
    pub fn controller_identity(&self) -> String {
        format!("rcc.{}", self.controller)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Run start, in seconds since the epoch.
    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Drop the recycle marker into this run's temp directory.
    ///
    /// Only the first call writes; it returns whether this call did.
    pub fn mark_temp_for_recycling(&self) -> bool {
        if self.marked.swap(true, Ordering::SeqCst) {
            return false;
        }
        let temp = &self.locations.temp;
        match recycle::mark_for_recycling(temp) {
            Ok(()) => debug!("[lifecycle] Marked {:?} for recycling", temp),
            Err(e) => debug!("[lifecycle] Could not mark {:?} for recycling: {}", temp, e),
        }
        true
    }

    pub fn is_marked_for_recycling(&self) -> bool {
        self.marked.load(Ordering::SeqCst)
    }
}

/// How the guarded command ended.
pub enum Outcome {
    Completed,
    Failed(anyhow::Error),
    Panicked(Box<dyn Any + Send + 'static>),
}

/// What the process does once everything is flushed.
pub enum Termination {
    Success,
    Exit(ControlledExit),
    Failure(anyhow::Error),
    Panic(Box<dyn Any + Send + 'static>),
}

impl Termination {
    /// Status the process ends with (101 is the Rust panic status).
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Success => 0,
            Termination::Exit(exit) => exit.code,
            Termination::Failure(_) => 1,
            Termination::Panic(_) => 101,
        }
    }

    /// Terminate accordingly. Returns only on success.
    pub fn apply(self) {
        match self {
            Termination::Success => {}
            Termination::Exit(exit) => {
                exit.show_message();
                flush_logs();
                std::process::exit(exit.code);
            }
            Termination::Failure(error) => {
                eprintln!("Error: {:?}", error);
                flush_logs();
                std::process::exit(1);
            }
            Termination::Panic(payload) => std::panic::resume_unwind(payload),
        }
    }
}

/// Owns the exit protocol for one process run.
///
/// Dropping the guard without concluding still marks the temp directory
/// for recycling.
pub struct LifecycleGuard {
    ctx: Arc<LifecycleContext>,
}

impl LifecycleGuard {
    /// Enter `Running`: create this run's temp directory and start the
    /// background recycling scan. Must be called within a tokio runtime.
    pub fn start(ctx: Arc<LifecycleContext>) -> Self {
        ctx.timeline().record("Start.");
        let temp = &ctx.locations().temp;
        if let Err(e) = std::fs::create_dir_all(temp) {
            warn!("[lifecycle] Failed to create temp folder {:?}: {}", temp, e);
        }
        recycle::start_temp_recycling(ctx.locations().temp_root());
        Self { ctx }
    }

    pub fn context(&self) -> Arc<LifecycleContext> {
        self.ctx.clone()
    }

    /// Run `body`, catching errors and panics, then conclude.
    pub async fn run<F>(self, body: F) -> Termination
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let outcome = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(Ok(())) => Outcome::Completed,
            Ok(Err(error)) => Outcome::Failed(error),
            Err(payload) => Outcome::Panicked(payload),
        };
        self.conclude(outcome).await
    }

    /// Mark for recycling, report unexpected failures, flush, and hand back
    /// the termination to apply.
    pub async fn conclude(self, outcome: Outcome) -> Termination {
        self.ctx.mark_temp_for_recycling();
        let termination = match outcome {
            Outcome::Completed => Termination::Success,
            Outcome::Failed(error) => match error.downcast::<ControlledExit>() {
                Ok(exit) => Termination::Exit(exit),
                Err(error) => {
                    error!("[lifecycle] Unexpected failure: {:?}", error);
                    self.report_origin();
                    Termination::Failure(error)
                }
            },
            Outcome::Panicked(payload) => {
                error!("[lifecycle] Unexpected panic: {}", panic_message(&*payload));
                self.report_origin();
                Termination::Panic(payload)
            }
        };
        self.flush().await;
        termination
    }

    fn report_origin(&self) {
        self.ctx.telemetry().background_metric(
            &self.ctx.controller_identity(),
            PANIC_ORIGIN_METRIC,
            self.ctx.origin(),
        );
    }

    async fn flush(&self) {
        self.ctx.telemetry().wait().await;
        self.ctx.timeline().record("End.");
        self.ctx.timeline().dump();
        flush_logs();
    }
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        self.ctx.mark_temp_for_recycling();
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Termination::Success.exit_code(), 0);
        assert_eq!(
            Termination::Exit(ControlledExit::new(7, "bye")).exit_code(),
            7
        );
        assert_eq!(
            Termination::Failure(anyhow::anyhow!("boom")).exit_code(),
            1
        );
        assert_eq!(Termination::Panic(Box::new("boom")).exit_code(), 101);
    }

    #[test]
    fn test_controlled_exit_survives_anyhow() {
        let error: anyhow::Error = ControlledExit::new(3, "stop here").into();
        assert_eq!(error.to_string(), "stop here");
        let exit = error.downcast::<ControlledExit>().unwrap();
        assert_eq!(exit.code, 3);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static text");
        assert_eq!(panic_message(&*payload), "static text");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned text"));
        assert_eq!(panic_message(&*payload), "owned text");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }

    #[test]
    fn test_timeline_keeps_order() {
        let timeline = Timeline::new();
        timeline.record("one");
        timeline.record("two");
        assert_eq!(timeline.events(), vec!["one".to_string(), "two".to_string()]);
    }
}
