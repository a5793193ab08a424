use std::path::PathBuf;

use crate::error::Error;

/// URI path the agent accepts continuous profile uploads on.
const AGENT_PROFILING_PATH: &str = "profiling/v1/input";

/// How the upload connection is dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transport {
    /// Dial the UNIX socket path, regardless of the URL host.
    Unix(PathBuf),
    /// Dial the agent's TCP address directly.
    Tcp(String),
    /// Normal http(s) dialing, no rewiring.
    Direct,
}

/// Whether uploads go through a local agent or straight to an ingest
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AgentMode {
    ViaAgent,
    Agentless,
}

/// Resolved upload destination.
#[derive(Debug, Clone)]
pub(crate) struct AgentEndpoint {
    pub transport: Transport,
    /// Absolute URL used for the POST.
    pub url: String,
    pub mode: AgentMode,
}

/// Parses a `scheme://address` agent socket string into an endpoint.
///
/// Accepted schemes are `unix`, `tcp`, `http` and `https`; anything else
/// fails with a config error.
pub(crate) fn resolve(agent_socket: &str) -> Result<AgentEndpoint, Error> {
    let (scheme, address) = agent_socket.split_once("://").ok_or_else(|| {
        Error::Config(format!(
            "could not parse agent socket value ({agent_socket})"
        ))
    })?;

    match scheme {
        "unix" => Ok(AgentEndpoint {
            transport: Transport::Unix(PathBuf::from(address)),
            url: format!("http://unix/{AGENT_PROFILING_PATH}"),
            mode: AgentMode::ViaAgent,
        }),
        "tcp" => Ok(AgentEndpoint {
            transport: Transport::Tcp(address.to_string()),
            url: format!("http://{address}/{AGENT_PROFILING_PATH}"),
            mode: AgentMode::ViaAgent,
        }),
        "http" | "https" => Ok(AgentEndpoint {
            transport: Transport::Direct,
            url: format!("{agent_socket}/{AGENT_PROFILING_PATH}"),
            mode: AgentMode::Agentless,
        }),
        _ => Err(Error::Config(format!(
            "invalid agent socket ({agent_socket})"
        ))),
    }
}
