//! Thin wrapper over the `pprof` signal sampler.
//!
//! The rest of the crate only sees start/stop and a byte buffer; the pprof
//! types stay contained here.

use pprof::ProfilerGuardBuilder;

use crate::error::SamplerError;

/// A running CPU sampling session. Dropping it also stops sampling, so the
/// collector cannot leak a live sampler on any exit path.
pub(crate) struct CpuSample {
    guard: pprof::ProfilerGuard<'static>,
}

/// Starts the process-wide CPU sampler.
///
/// `frequency_hz == 0` keeps the sampler's own default rate. The sampler is
/// a process singleton; a second concurrent start fails and the caller skips
/// the tick.
pub(crate) fn start_cpu(frequency_hz: i32) -> Result<CpuSample, SamplerError> {
    let mut builder =
        ProfilerGuardBuilder::default().blocklist(&["libc", "libgcc", "pthread", "vdso"]);

    if frequency_hz != 0 {
        builder = builder.frequency(frequency_hz);
    }

    let guard = builder
        .build()
        .map_err(|e| SamplerError::Start(e.to_string()))?;

    Ok(CpuSample { guard })
}

impl CpuSample {
    /// Stops sampling and serializes whatever was captured as a pprof
    /// protobuf. A session interrupted early yields a truncated (possibly
    /// sample-free) profile rather than an error.
    pub(crate) fn stop(self) -> Result<Vec<u8>, SamplerError> {
        use pprof::protos::Message as _;

        let report = self
            .guard
            .report()
            .build()
            .map_err(|e| SamplerError::Report(e.to_string()))?;

        let profile = report
            .pprof()
            .map_err(|e| SamplerError::Report(e.to_string()))?;

        Ok(profile.encode_to_vec())
    }
}
