//! Connectivity prober
//!
//! Probes run inside the source pod through the [`PodExecutor`] seam. The
//! test pods serve `agnhost serve-hostname`, which answers every TCP
//! connection or UDP datagram with the pod's hostname, so a probe reports
//! both whether a connection was made and which backend answered.
//!
//! Three outcomes are kept apart:
//!
//! - connected (`ProbeOutcome { connected: true, endpoint: Some(..) }`)
//! - not connected: refused, timed out, no route. A meaningful negative
//!   result, never an error.
//! - [`ProbeError`]: the probe could not run at all (exec layer failure,
//!   probe binary missing). The validator counts these separately.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use crate::model::{Pod, Protocol};
use svcval_common::Error;

/// Extra time allowed on top of the probe timeout for the exec round trip
pub const EXEC_GRACE: Duration = Duration::from_secs(5);

/// Output of a command run inside a container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Captured stdout, whitespace trimmed
    pub stdout: String,
    /// Captured stderr, whitespace trimmed
    pub stderr: String,
    /// Exit code, when the exec layer reported one
    pub exit_code: Option<i32>,
}

/// Runs commands inside containers
///
/// This is the only primitive the prober needs from the cluster. An `Err`
/// means the command could not be run at all; a command that ran and failed
/// is an `Ok` with a non-zero exit code.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodExecutor: Send + Sync {
    /// Execute `command` in `container` of `namespace/pod`
    async fn exec_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error>;
}

/// The probe could not be executed
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// The exec layer failed (pod gone, API unreachable, stream error)
    #[error("exec failed in {pod}/{container}: {message}")]
    Exec {
        /// Source pod as `namespace/name`
        pod: String,
        /// Source container
        container: String,
        /// Description of what failed
        message: String,
    },

    /// The probe tooling is missing or cannot run in the source container
    #[error("probe tooling unavailable in {pod}/{container}: {message}")]
    Tooling {
        /// Source pod as `namespace/name`
        pod: String,
        /// Source container
        container: String,
        /// Description of what failed
        message: String,
    },
}

impl From<ProbeError> for Error {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Exec {
                pod,
                container,
                message,
            }
            | ProbeError::Tooling {
                pod,
                container,
                message,
            } => Error::exec(pod, container, message),
        }
    }
}

/// A single probe from a source container to a destination
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Source namespace
    pub namespace: String,
    /// Source pod
    pub pod: String,
    /// Source container the probe runs in
    pub container: String,
    /// Destination address (IP or DNS name)
    pub address: String,
    /// Destination port
    pub port: i32,
    /// Protocol to probe with
    pub protocol: Protocol,
    /// Upper bound for the connection attempt
    pub timeout: Duration,
}

impl ProbeRequest {
    /// Build a request probing from `source`'s first container
    pub fn from_pod(
        source: &Pod,
        address: impl Into<String>,
        port: i32,
        protocol: Protocol,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let container = source.source_container().ok_or_else(|| {
            Error::validation(format!("pod {} has no container to probe from", source.key()))
        })?;
        Ok(Self {
            namespace: source.namespace.clone(),
            pod: source.name.clone(),
            container: container.name.clone(),
            address: address.into(),
            port,
            protocol,
            timeout,
        })
    }

    fn source(&self) -> String {
        format!("{}/{}", self.namespace, self.pod)
    }
}

/// Result of a probe that ran
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Whether a connection was made and answered
    pub connected: bool,
    /// Identity of the backend that answered
    pub endpoint: Option<String>,
    /// The command that was run, for diagnostics
    pub command: String,
}

impl ProbeOutcome {
    fn not_connected(command: String) -> Self {
        Self {
            connected: false,
            endpoint: None,
            command,
        }
    }
}

/// Issues one connection attempt and classifies the outcome
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe once; transport failures are `Ok(connected = false)`
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeOutcome, ProbeError>;
}

/// Prober built on `nc` inside the source container
pub struct NcProber {
    executor: Arc<dyn PodExecutor>,
}

impl NcProber {
    /// Create a prober on top of an executor
    pub fn new(executor: Arc<dyn PodExecutor>) -> Self {
        Self { executor }
    }
}

/// Build the probe command for a destination
///
/// `nc -w` takes whole seconds; sub-second timeouts round up to one.
pub fn probe_command(
    address: &str,
    port: i32,
    protocol: Protocol,
    timeout: Duration,
) -> Option<Vec<String>> {
    let secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
    let flags = match protocol {
        Protocol::Tcp => "",
        Protocol::Udp => " -u",
        Protocol::Sctp => return None,
    };
    Some(vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "echo hostname | nc -w {}{} {} {}",
            secs, flags, address, port
        ),
    ])
}

/// The shell could not run `nc` at all
///
/// Resolver failures such as `nc: bad address` or `nc: host not found` come
/// from a running `nc` and mean the destination is unreachable.
fn missing_tooling(output: &ExecOutput) -> bool {
    matches!(output.exit_code, Some(126) | Some(127))
        || output.stderr.lines().map(str::trim_end).any(|line| {
            line == "nc: not found" || line.ends_with(": nc: not found")
        })
}

/// Classify the output of a probe command
pub fn interpret_output(
    request: &ProbeRequest,
    command: String,
    output: &ExecOutput,
) -> Result<ProbeOutcome, ProbeError> {
    if missing_tooling(output) {
        return Err(ProbeError::Tooling {
            pod: request.source(),
            container: request.container.clone(),
            message: if output.stderr.is_empty() {
                format!("exit code {:?}", output.exit_code)
            } else {
                output.stderr.clone()
            },
        });
    }

    let endpoint = output
        .stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string);

    // No exit status means the command's fate is unknown
    match (output.exit_code, endpoint) {
        (Some(0), Some(endpoint)) => Ok(ProbeOutcome {
            connected: true,
            endpoint: Some(endpoint),
            command,
        }),
        _ => Ok(ProbeOutcome::not_connected(command)),
    }
}

#[async_trait]
impl Prober for NcProber {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeOutcome, ProbeError> {
        let Some(command) =
            probe_command(&request.address, request.port, request.protocol, request.timeout)
        else {
            return Err(ProbeError::Tooling {
                pod: request.source(),
                container: request.container.clone(),
                message: format!("nc cannot probe {}", request.protocol),
            });
        };
        let rendered = command.join(" ");

        trace!(
            source = %request.source(),
            address = %request.address,
            port = request.port,
            protocol = %request.protocol,
            "Probing"
        );

        let exec = self.executor.exec_in_container(
            &request.namespace,
            &request.pod,
            &request.container,
            command,
        );
        let output = match tokio::time::timeout(request.timeout + EXEC_GRACE, exec).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProbeError::Exec {
                    pod: request.source(),
                    container: request.container.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                debug!(
                    source = %request.source(),
                    address = %request.address,
                    port = request.port,
                    "Probe exceeded its bound, treating as not connected"
                );
                return Ok(ProbeOutcome::not_connected(rendered));
            }
        };

        interpret_output(request, rendered, &output)
    }
}

/// Which backend answered each source
pub type AffinityMap = BTreeMap<String, String>;

/// Probe a virtual address once from every source and record who answered
///
/// The result seeds an affinity matrix: each source is expected to keep
/// reaching the backend that answered it here.
pub async fn establish_affinity(
    prober: &dyn Prober,
    sources: &[Pod],
    address: &str,
    port: i32,
    protocol: Protocol,
    timeout: Duration,
) -> Result<AffinityMap, Error> {
    let mut affinity = AffinityMap::new();
    for source in sources {
        let request = ProbeRequest::from_pod(source, address, port, protocol, timeout)?;
        let outcome = prober.probe(&request).await?;
        match (outcome.connected, outcome.endpoint) {
            (true, Some(endpoint)) => {
                debug!(source = %source.key(), endpoint = %endpoint, "Affinity established");
                affinity.insert(source.name.clone(), endpoint);
            }
            _ => {
                return Err(Error::validation(format!(
                    "failed to establish affinity from {} to {}:{} with: {}",
                    source.key(),
                    address,
                    port,
                    outcome.command
                )))
            }
        }
    }
    Ok(affinity)
}
