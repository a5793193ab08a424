use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::SamplerError;
use crate::profiler::interruptible_sleep;
use crate::sampler;

/// The kinds of runtime profile the probe can capture.
///
/// The display form doubles as the multipart field name and filename on the
/// wire, so it must stay lowercase and stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ProfileKind {
    /// CPU time sampling profile.
    Cpu,
}

impl ProfileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured profile. Immutable after construction; dropped once its
/// batch has been uploaded, exhausted its retries, or been evicted.
pub(crate) struct Profile {
    pub kind: ProfileKind,
    pub data: Vec<u8>,
}

/// The profiles collected in a single scheduler tick, uploaded together as
/// one multipart request. Order within the batch is collection-completion
/// order; the ingest side does not depend on it.
#[derive(Default)]
pub(crate) struct ProfileBatch {
    pub profiles: Vec<Profile>,
}

/// Collects one profile of the given kind, or `None` when the capture came
/// back empty (for instance when shutdown interrupted it immediately).
pub(crate) async fn collect(
    kind: ProfileKind,
    cfg: &Config,
    cancel: &CancellationToken,
) -> Result<Option<Profile>, SamplerError> {
    match kind {
        ProfileKind::Cpu => collect_cpu(cfg, cancel).await,
    }
}

/// Drives the platform CPU sampler for the configured duration. The sleep is
/// interruptible: on shutdown the sampler is still stopped and whatever was
/// captured so far is returned.
async fn collect_cpu(
    cfg: &Config,
    cancel: &CancellationToken,
) -> Result<Option<Profile>, SamplerError> {
    let sample = match sampler::start_cpu(cfg.cpu_profile_rate) {
        Ok(sample) => sample,
        Err(e) => {
            error!(error = %e, "Error starting CPU profile, skipping this period");
            return Err(e);
        }
    };

    debug!(duration = ?cfg.cpu_duration, "CPU profile started");
    interruptible_sleep(cfg.cpu_duration, cancel).await;

    // Report building symbolizes frames, which is CPU-bound work.
    let data = tokio::task::spawn_blocking(move || sample.stop())
        .await
        .map_err(|e| SamplerError::Report(format!("sampler stop task failed: {e}")))??;

    debug!(bytes = data.len(), "CPU profile ended");

    if data.is_empty() {
        return Ok(None);
    }

    Ok(Some(Profile {
        kind: ProfileKind::Cpu,
        data,
    }))
}
