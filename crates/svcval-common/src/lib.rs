//! Common types for svcval: errors, bounded readiness waits, and client helpers

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod wait;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key every svcval-managed pod carries with its own name
///
/// Per-pod services select on this label.
pub const POD_LABEL_KEY: &str = "pod";

/// Label key marking resources created by svcval
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL_KEY`] for svcval resources
pub const MANAGED_BY_SVCVAL: &str = "svcval";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "svcval";

/// Cluster DNS suffix used to address services by name
pub const CLUSTER_DNS_SUFFIX: &str = "svc.cluster.local";
