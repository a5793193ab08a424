use thiserror::Error;

/// Errors surfaced to the host from [`crate::start`].
///
/// Everything that goes wrong after startup (sampler failures, upload
/// failures, evictions) is recovered inside the workers and logged; the host
/// never receives asynchronous profiling errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The agent socket string was malformed or used an unknown scheme.
    #[error("{0}")]
    Config(String),

    /// A profiler is already active in this process.
    #[error("profiler is already running")]
    AlreadyRunning,
}

/// Upload failures, classified by how the uploader should react.
#[derive(Debug, Error)]
pub(crate) enum UploadError {
    /// Transient transport failure, retried up to the cap.
    #[error("{0}")]
    Retriable(String),

    /// The agent predates continuous profiling (404 or non-HTTP response).
    #[error("Continuous profiling feature requires Blackfire Agent >= 2.13.0")]
    OldAgent,

    /// Unexpected non-2xx, non-404 status. Not retried.
    #[error("unexpected agent response: {0}")]
    Protocol(String),

    /// All retry attempts failed; the batch is dropped.
    #[error("failed after {attempts} upload attempts, last error: {last}")]
    RetriesExhausted { attempts: usize, last: String },
}

/// Failures of the platform CPU sampler. The affected kind is skipped for
/// the tick; other kinds still make it into the batch.
#[derive(Debug, Error)]
pub(crate) enum SamplerError {
    #[error("failed to start CPU sampler: {0}")]
    Start(String),

    #[error("failed to build CPU profile: {0}")]
    Report(String),
}
