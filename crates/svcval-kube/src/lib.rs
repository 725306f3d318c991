//! Kubernetes side of svcval
//!
//! - [`exec`]: runs probe commands in test pods
//! - [`manager`]: namespace and pod lifecycle
//! - [`service`]: service lifecycle and bounded attribute waits
//! - [`templates`]: pod and service manifests derived from model pods

#![deny(missing_docs)]

pub mod exec;
pub mod manager;
pub mod service;
pub mod templates;

pub use exec::KubeExecutor;
pub use manager::{Manager, PodReadiness};
pub use service::{ServiceHandle, Services};
pub use templates::{create_service_from_template, ServiceTemplate};
