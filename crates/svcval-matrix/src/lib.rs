//! Reachability validation engine
//!
//! Declares a pod topology ([`Model`]), the expected connectivity between
//! every ordered pair of pods ([`Reachability`]), and drives probes through a
//! [`Prober`] to compare expectation against observation ([`Validator`]).
//!
//! Nothing here talks to a cluster directly. The Kubernetes side lives in
//! `svcval-kube`, which provides a [`PodExecutor`] and keeps the model's
//! network attributes in sync with the services it creates.

#![deny(missing_docs)]

pub mod model;
pub mod peer;
pub mod probe;
pub mod reachability;
pub mod test_case;
pub mod validator;

pub use model::{Container, ExternalIp, Model, Pod, PodKey, Protocol};
pub use peer::Peer;
pub use probe::{
    establish_affinity, AffinityMap, ExecOutput, NcProber, PodExecutor, ProbeError, ProbeOutcome,
    ProbeRequest, Prober,
};
pub use reachability::{Reachability, Summary};
pub use test_case::{ServiceType, TestCase};
pub use validator::{ProbeFailure, ValidationReport, Validator, ValidatorConfig};
