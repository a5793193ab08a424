//! Continuous profiling probe for long-running Rust services.
//!
//! At a fixed cadence the probe captures CPU profiles of the host process
//! and uploads them, tagged with process identity labels, to a local
//! Blackfire agent (UNIX socket or TCP loopback) or directly to an ingest
//! endpoint (agentless http/https). It is built to stay out of the way:
//! sampling cost aside it does not perturb the host, it rides out agent
//! downtime with bounded buffering and retries, and it shuts down cleanly
//! when asked.
//!
//! ```no_run
//! use blackfire_conprof::ProfilerOptions;
//!
//! #[tokio::main]
//! async fn main() {
//!     blackfire_conprof::start(ProfilerOptions::new().with_app_name("checkout"))
//!         .await
//!         .expect("profiler failed to start");
//!
//!     // ... application runs ...
//!
//!     blackfire_conprof::stop().await;
//! }
//! ```
//!
//! Exactly one profiler can be active per process. All post-start failures
//! (sampler trouble, agent unavailability, upload errors) are handled
//! internally and logged through [`tracing`]; the host only ever sees
//! errors from [`start`].

mod config;
mod endpoint;
mod error;
mod logger;
mod multipart;
mod profile;
mod profiler;
mod queue;
mod sampler;
#[doc(hidden)]
pub mod transport;

pub use config::ProfilerOptions;
pub use error::Error;
pub use profile::ProfileKind;

/// Starts the continuous profiler.
///
/// Reads the `BLACKFIRE_*` environment once, applies `options` on top,
/// resolves the agent endpoint and spawns the scheduler and uploader
/// workers on the ambient tokio runtime.
///
/// Fails with [`Error::AlreadyRunning`] while a profiler is active and with
/// [`Error::Config`] for an unusable agent socket.
pub async fn start(options: ProfilerOptions) -> Result<(), Error> {
    profiler::start(options).await
}

/// Stops the active profiler and waits for its workers to exit.
///
/// Idempotent: a no-op when no profiler is running. On return no collector
/// is sampling and no upload is in flight.
pub async fn stop() {
    profiler::stop().await
}

/// Probe release version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
