//! Command execution inside test pods
//!
//! Runs a command through the pods/exec subresource with stdout and stderr
//! captured and no TTY, then reads the exit code from the exec status that
//! the API server sends on the error channel.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use svcval_common::Error;
use svcval_matrix::{ExecOutput, PodExecutor};

/// Exit code carried by a finished exec session
///
/// `Ok(Some(code))` for a command that ran, `Ok(None)` when the server sent
/// no status, `Err(message)` when the server could not run the command at
/// all. A non-zero exit whose code cannot be read is reported as 1.
pub fn exit_code_from_status(status: Option<&Status>) -> Result<Option<i32>, String> {
    let Some(status) = status else {
        return Ok(None);
    };
    if status.status.as_deref() == Some("Success") {
        return Ok(Some(0));
    }
    if status.reason.as_deref() == Some("NonZeroExitCode") {
        let code = status
            .details
            .as_ref()
            .and_then(|d| d.causes.as_ref())
            .and_then(|causes| {
                causes
                    .iter()
                    .find(|c| c.reason.as_deref() == Some("ExitCode"))
                    .and_then(|c| c.message.as_deref())
            })
            .and_then(|m| m.trim().parse::<i32>().ok())
            .filter(|code| *code != 0)
            .unwrap_or(1);
        return Ok(Some(code));
    }
    Err(status
        .message
        .clone()
        .unwrap_or_else(|| "exec failed without a message".to_string()))
}

async fn read_stream<R>(reader: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        trace!(error = %e, "Exec stream closed with error");
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

/// [`PodExecutor`] backed by the Kubernetes exec API
#[derive(Clone)]
pub struct KubeExecutor {
    client: Client,
}

impl KubeExecutor {
    /// Create an executor using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExecutor for KubeExecutor {
    async fn exec_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams {
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            container: Some(container.to_string()),
            max_stdin_buf_size: None,
            max_stdout_buf_size: None,
            max_stderr_buf_size: None,
        };
        let target = format!("{}/{}", namespace, pod);

        let mut attached = api
            .exec(pod, command, &params)
            .await
            .map_err(|e| Error::exec(&target, container, e.to_string()))?;

        let status = attached.take_status();
        let (stdout, stderr) = tokio::join!(
            read_stream(attached.stdout()),
            read_stream(attached.stderr())
        );
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        if let Err(e) = attached.join().await {
            debug!(pod = %target, container, error = %e, "Exec session ended with error");
        }

        let exit_code = exit_code_from_status(status.as_ref())
            .map_err(|message| Error::exec(&target, container, message))?;

        trace!(pod = %target, container, exit_code = ?exit_code, "Exec finished");
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}
