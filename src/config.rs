use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::profile::ProfileKind;
use crate::transport::HttpClient;

pub(crate) const DEFAULT_CPU_DURATION: Duration = Duration::from_secs(45);
pub(crate) const DEFAULT_PERIOD: Duration = Duration::from_secs(45);
pub(crate) const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
const DEFAULT_AGENT_SOCKET: &str = "unix:///opt/homebrew/var/run/blackfire-agent.sock";
#[cfg(all(target_os = "macos", not(target_arch = "aarch64")))]
const DEFAULT_AGENT_SOCKET: &str = "unix:///usr/local/var/run/blackfire-agent.sock";
#[cfg(not(target_os = "macos"))]
const DEFAULT_AGENT_SOCKET: &str = "unix:///var/run/blackfire/agent.sock";

/// Effective profiler configuration. Immutable once the profiler is running.
pub(crate) struct Config {
    pub cpu_duration: Duration,
    pub period: Duration,
    pub upload_timeout: Duration,
    /// CPU sample rate in Hz; 0 keeps the platform default.
    pub cpu_profile_rate: i32,
    pub agent_socket: String,
    pub kinds: Vec<ProfileKind>,
    pub labels: HashMap<String, String>,
    pub server_id: String,
    pub server_token: String,
    /// Injected dialing client; `None` builds the default from the resolved
    /// endpoint.
    pub http_client: Option<Arc<dyn HttpClient>>,
}

impl Config {
    /// Builds the effective configuration: defaults, then environment, then
    /// programmatic options in the order they were given.
    pub(crate) fn build(options: ProfilerOptions) -> Self {
        let mut cfg = Self::from_env();
        options.apply(&mut cfg);

        // Sampling longer than the period would overlap ticks.
        if cfg.cpu_duration > cfg.period {
            cfg.cpu_duration = cfg.period;
        }

        cfg
    }

    fn from_env() -> Self {
        let mut cfg = Self {
            cpu_duration: DEFAULT_CPU_DURATION,
            period: DEFAULT_PERIOD,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            cpu_profile_rate: 0,
            agent_socket: DEFAULT_AGENT_SOCKET.to_string(),
            kinds: vec![ProfileKind::Cpu],
            labels: default_labels(),
            server_id: String::new(),
            server_token: String::new(),
            http_client: None,
        };

        if let Some(v) = env_value("BLACKFIRE_AGENT_SOCKET") {
            cfg.agent_socket = v;
        }
        if let Some(v) = env_value("BLACKFIRE_SERVER_ID") {
            cfg.server_id = v;
        }
        if let Some(v) = env_value("BLACKFIRE_SERVER_TOKEN") {
            cfg.server_token = v;
        }

        if let Some(d) = env_duration_secs("BLACKFIRE_CONPROF_CPU_DURATION", "CPU duration") {
            cfg.cpu_duration = d;
        }
        if let Some(d) = env_duration_secs("BLACKFIRE_CONPROF_PERIOD", "period") {
            cfg.period = d;
        }
        if let Some(d) = env_duration_secs("BLACKFIRE_CONPROF_UPLOAD_TIMEOUT", "upload timeout") {
            cfg.upload_timeout = d;
        }

        if let Some(v) = env_value("BLACKFIRE_CONPROF_CPU_PROFILERATE") {
            match v.parse::<i32>() {
                Ok(hz) => cfg.cpu_profile_rate = hz,
                Err(_) => error!(value = %v, "Invalid CPU profile rate value, keeping default"),
            }
        }

        cfg
    }
}

/// Labels attached to every upload. User labels merge over these later, per
/// key.
fn default_labels() -> HashMap<String, String> {
    let mut labels = HashMap::from([
        ("runtime".to_string(), "rust".to_string()),
        ("runtime_os".to_string(), std::env::consts::OS.to_string()),
        ("runtime_arch".to_string(), std::env::consts::ARCH.to_string()),
        (
            "runtime_version".to_string(),
            env!("CONPROF_RUSTC_VERSION").to_string(),
        ),
    ]);

    if let Ok(host) = hostname::get() {
        labels.insert("host".to_string(), host.to_string_lossy().into_owned());
    }

    // Environment-sourced labels; for a given label name the first set
    // variable wins and nothing overrides an existing entry.
    let lookup = [
        ("application_name", "BLACKFIRE_CONPROF_APP_NAME"),
        ("application_name", "PLATFORM_APPLICATION_NAME"),
        ("project_id", "PLATFORM_PROJECT"),
    ];

    for (label, var) in lookup {
        if labels.contains_key(label) {
            continue;
        }
        if let Some(v) = env_value(var) {
            labels.insert(label.to_string(), v);
        }
    }

    labels
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Reads a whole-seconds duration variable. Invalid values are logged and
/// ignored so the default stays in effect.
fn env_duration_secs(name: &str, what: &str) -> Option<Duration> {
    let v = env_value(name)?;
    match v.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            error!(value = %v, "Invalid {what} value, keeping default");
            None
        }
    }
}

type ApplyFn = Box<dyn FnOnce(&mut Config) + Send>;

/// Chainable profiler options, applied in order on top of the environment.
///
/// ```no_run
/// use std::time::Duration;
/// use blackfire_conprof::ProfilerOptions;
///
/// # async fn demo() -> Result<(), blackfire_conprof::Error> {
/// blackfire_conprof::start(
///     ProfilerOptions::new()
///         .with_app_name("checkout")
///         .with_cpu_duration(Duration::from_secs(30)),
/// )
/// .await
/// # }
/// ```
#[derive(Default)]
pub struct ProfilerOptions {
    ops: Vec<ApplyFn>,
}

impl ProfilerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long each CPU sampling session runs. Clamped to the period.
    pub fn with_cpu_duration(mut self, duration: Duration) -> Self {
        self.ops.push(Box::new(move |cfg| cfg.cpu_duration = duration));
        self
    }

    /// CPU sample rate in Hz; 0 keeps the platform default.
    pub fn with_cpu_profile_rate(mut self, hz: i32) -> Self {
        self.ops.push(Box::new(move |cfg| cfg.cpu_profile_rate = hz));
        self
    }

    /// Replaces the set of profile kinds captured each tick.
    pub fn with_profile_types(mut self, kinds: &[ProfileKind]) -> Self {
        let kinds = kinds.to_vec();
        self.ops.push(Box::new(move |cfg| cfg.kinds = kinds));
        self
    }

    /// Shortcut setting the `application_name` label.
    pub fn with_app_name(mut self, name: &str) -> Self {
        let name = name.to_string();
        self.ops.push(Box::new(move |cfg| {
            cfg.labels.insert("application_name".to_string(), name);
        }));
        self
    }

    /// Merges labels into the prepopulated set, overriding per key.
    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.ops.push(Box::new(move |cfg| cfg.labels.extend(labels)));
        self
    }

    /// Overrides the agent socket (`unix://…`, `tcp://…`, `http(s)://…`).
    pub fn with_agent_socket(mut self, agent_socket: &str) -> Self {
        let agent_socket = agent_socket.to_string();
        self.ops
            .push(Box::new(move |cfg| cfg.agent_socket = agent_socket));
        self
    }

    /// Per-request upload timeout.
    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.ops.push(Box::new(move |cfg| cfg.upload_timeout = timeout));
        self
    }

    /// Basic auth credentials; both must be non-empty for the header to be
    /// sent.
    pub fn with_credentials(mut self, server_id: &str, server_token: &str) -> Self {
        let id = server_id.to_string();
        let token = server_token.to_string();
        self.ops.push(Box::new(move |cfg| {
            cfg.server_id = id;
            cfg.server_token = token;
        }));
        self
    }

    /// Replaces the dialing client. Internal knob used by tests to mock the
    /// agent.
    #[doc(hidden)]
    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.ops
            .push(Box::new(move |cfg| cfg.http_client = Some(client)));
        self
    }

    /// Collection period. Internal knob used by tests.
    #[doc(hidden)]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.ops.push(Box::new(move |cfg| cfg.period = period));
        self
    }

    fn apply(self, cfg: &mut Config) {
        for op in self.ops {
            op(cfg);
        }
    }
}
