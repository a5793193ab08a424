use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ProfilerOptions};
use crate::endpoint::{self, AgentMode};
use crate::error::{Error, UploadError};
use crate::logger;
use crate::multipart;
use crate::profile::{self, ProfileBatch};
use crate::queue::{UploadQueue, UPLOAD_QUEUE_CAPACITY};
use crate::transport::{AgentClient, DefaultHttpClient, HttpClient, PostStatus};

const MAX_UPLOAD_RETRIES: usize = 2;

/// The process-wide profiler slot. Only `start`/`stop` touch it.
fn active_profiler() -> &'static tokio::sync::Mutex<Option<ProfilerHandle>> {
    static ACTIVE_PROFILER: std::sync::OnceLock<tokio::sync::Mutex<Option<ProfilerHandle>>> =
        std::sync::OnceLock::new();
    ACTIVE_PROFILER.get_or_init(|| tokio::sync::Mutex::new(None))
}

/// Starts the profiler, rejecting a second instance in the same process.
pub(crate) async fn start(options: ProfilerOptions) -> Result<(), Error> {
    logger::init_from_env();

    let mut active = active_profiler().lock().await;
    if active.is_some() {
        return Err(Error::AlreadyRunning);
    }

    let cfg = Config::build(options);
    let endpoint = endpoint::resolve(&cfg.agent_socket)?;

    let client: Arc<dyn HttpClient> = match cfg.http_client.clone() {
        Some(client) => client,
        None => Arc::new(DefaultHttpClient::new(&endpoint)?),
    };

    let credentials = (!cfg.server_id.is_empty() && !cfg.server_token.is_empty())
        .then(|| (cfg.server_id.clone(), cfg.server_token.clone()));
    let agent = Arc::new(AgentClient::new(
        client,
        endpoint.url.clone(),
        credentials,
        cfg.upload_timeout,
    ));

    info!(
        endpoint = %endpoint.url,
        agentless = matches!(endpoint.mode, AgentMode::Agentless),
        period = ?cfg.period,
        cpu_duration = ?cfg.cpu_duration,
        "continuous profiler started",
    );

    *active = Some(ProfilerHandle::spawn(Arc::new(cfg), agent));

    Ok(())
}

/// Stops the active profiler, waiting for both workers to exit. A no-op
/// when nothing is running, so calling it twice is safe.
pub(crate) async fn stop() {
    let mut active = active_profiler().lock().await;
    if let Some(handle) = active.take() {
        handle.shutdown().await;
    }
}

/// Handle on the two long-lived workers of a running profiler.
struct ProfilerHandle {
    cancel: CancellationToken,
    scheduler: JoinHandle<()>,
    uploader: JoinHandle<()>,
}

impl ProfilerHandle {
    fn spawn(cfg: Arc<Config>, agent: Arc<AgentClient>) -> Self {
        let cancel = CancellationToken::new();
        let queue = Arc::new(UploadQueue::new(UPLOAD_QUEUE_CAPACITY));

        let scheduler = tokio::spawn(run_scheduler(
            Arc::clone(&cfg),
            Arc::clone(&queue),
            cancel.clone(),
        ));
        let uploader = tokio::spawn(run_uploader(cfg, agent, queue, cancel.clone()));

        Self {
            cancel,
            scheduler,
            uploader,
        }
    }

    /// Broadcasts shutdown and joins both workers. On return no collector is
    /// sampling and no request is in flight.
    async fn shutdown(self) {
        self.cancel.cancel();

        if let Err(e) = self.scheduler.await {
            warn!(error = %e, "scheduler task join failed");
        }
        if let Err(e) = self.uploader.await {
            warn!(error = %e, "uploader task join failed");
        }
    }
}

/// Waits for the duration or for shutdown, whichever comes first.
pub(crate) async fn interruptible_sleep(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Periodic collection loop. Each tick runs one collector per configured
/// kind concurrently, enqueues the resulting batch, then waits for the next
/// tick or shutdown. Closes the upload queue on exit.
async fn run_scheduler(cfg: Arc<Config>, queue: Arc<UploadQueue>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(cfg.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; collection below starts the
    // cycle, so consume it.
    ticker.tick().await;

    loop {
        let mut collectors = JoinSet::new();
        for kind in cfg.kinds.clone() {
            let cfg = Arc::clone(&cfg);
            let cancel = cancel.clone();
            collectors
                .spawn(async move { (kind, profile::collect(kind, &cfg, &cancel).await) });
        }

        // Batch order is collection-completion order; ingest does not care.
        let mut batch = ProfileBatch::default();
        while let Some(joined) = collectors.join_next().await {
            match joined {
                Ok((_, Ok(Some(profile)))) => batch.profiles.push(profile),
                Ok((kind, Ok(None))) => debug!(kind = %kind, "profile came back empty, skipping"),
                Ok((kind, Err(e))) => debug!(kind = %kind, error = %e, "Error getting profile"),
                Err(e) => warn!(error = %e, "collector task join failed"),
            }
        }

        queue.push(batch);

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Profiler interrupted");
                queue.close();
                return;
            }
            _ = ticker.tick() => {}
        }
    }
}

/// Upload loop: drains the queue until shutdown, logging each outcome.
/// Failures are recovered here; the host never sees them.
async fn run_uploader(
    cfg: Arc<Config>,
    agent: Arc<AgentClient>,
    queue: Arc<UploadQueue>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            batch = queue.recv() => {
                let Some(batch) = batch else { return };

                match do_upload(&cfg, &agent, &batch, &cancel).await {
                    Ok(UploadOutcome::Uploaded) => debug!("Upload profile succeeded"),
                    Ok(UploadOutcome::Interrupted) => debug!("upload abandoned by shutdown"),
                    Err(e) => error!(error = %e, "Failed to upload profile"),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadOutcome {
    Uploaded,
    /// Shutdown fired mid-upload; the batch was dropped on purpose and this
    /// is not an error.
    Interrupted,
}

/// Uploads one batch with bounded retries and jittered backoff. The body is
/// consumed by each attempt, so every retry re-encodes.
async fn do_upload(
    cfg: &Config,
    agent: &AgentClient,
    batch: &ProfileBatch,
    cancel: &CancellationToken,
) -> Result<UploadOutcome, UploadError> {
    let mut last_error = String::new();

    for _ in 0..MAX_UPLOAD_RETRIES {
        if cancel.is_cancelled() {
            return Ok(UploadOutcome::Interrupted);
        }

        let (content_type, body) = multipart::encode_batch(&cfg.labels, batch);

        match agent.post(&content_type, body, cancel).await {
            Ok(PostStatus::Uploaded) => return Ok(UploadOutcome::Uploaded),
            Ok(PostStatus::Interrupted) => return Ok(UploadOutcome::Interrupted),
            Err(UploadError::Retriable(message)) => {
                let wait = backoff_jitter(cfg.period);
                error!(error = %message, wait = ?wait, "Profile upload failed, trying again");
                last_error = message;
                interruptible_sleep(wait, cancel).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(UploadError::RetriesExhausted {
        attempts: MAX_UPLOAD_RETRIES,
        last: last_error,
    })
}

/// Uniform draw over `[0, period)` to decorrelate retry storms across
/// replicas.
fn backoff_jitter(period: Duration) -> Duration {
    let nanos = period.as_nanos().min(u128::from(u64::MAX)) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}
