//! rcc - run commands inside isolated, content-identified environments.
//!
//! Environment identity and assembly live in `rcc-env`; this crate owns the
//! process around them:
//!
//! - [`lifecycle`]: run a command, then flush telemetry and logs and exit
//! - [`recycle`]: deferred deletion of per-process temp directories
//! - [`stamps`]: once-a-day throttling of recurring events
//! - [`telemetry`]: background metric submission
//! - [`commands`]: the CLI subcommands

pub mod commands;
pub mod lifecycle;
pub mod logging;
pub mod recycle;
pub mod stamps;
pub mod telemetry;

pub use lifecycle::{ControlledExit, LifecycleContext, LifecycleGuard, Outcome, Termination};
pub use telemetry::{LogSink, Metric, MetricSink, Telemetry};
