//! Error types for svcval
//!
//! Errors carry enough context (pod, container, resource, attribute) to make
//! a failed validation run debuggable from the log alone. Readiness failures
//! abort a scenario before any probing starts; exec failures reach the
//! validation report as inconclusive pairs instead.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for svcval operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Misconfigured model or test case
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// A network attribute was not assigned within its bounded wait
    #[error("readiness error for {resource} ({attribute}): {message}")]
    Readiness {
        /// Resource being waited on (e.g., "service/ns/pod-1")
        resource: String,
        /// Attribute that never became ready (e.g., "clusterIP", "nodePort")
        attribute: String,
        /// Description of what failed
        message: String,
    },

    /// The exec layer could not run a command inside a container
    #[error("exec error in {pod}/{container}: {message}")]
    Exec {
        /// Pod identity as `namespace/name`
        pod: String,
        /// Container the command targeted
        container: String,
        /// Description of what failed
        message: String,
    },

    /// A validation run was cancelled before every pair was probed
    #[error("run aborted after {completed}/{total} probes")]
    Aborted {
        /// Probes that finished before cancellation
        completed: usize,
        /// Probes the run was going to issue
        total: usize,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_client", "wait")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a readiness error for a resource attribute
    pub fn readiness(
        resource: impl Into<String>,
        attribute: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Readiness {
            resource: resource.into(),
            attribute: attribute.into(),
            message: msg.into(),
        }
    }

    /// Create an exec error for a pod container
    pub fn exec(pod: impl Into<String>, container: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Exec {
            pod: pod.into(),
            container: container.into(),
            message: msg.into(),
        }
    }

    /// Create an aborted-run error
    pub fn aborted(completed: usize, total: usize) -> Self {
        Self::Aborted { completed, total }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }
}
