//! Run configuration
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! is a valid configuration. The file is chosen by `--config`, falling back
//! to the `SVCVAL_CONFIG` environment variable; individual CLI flags then
//! override what the file says.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use svcval_matrix::{Container, Protocol, ValidatorConfig};

use crate::{Error, Result};

/// Environment variable naming the run config file
pub const SVCVAL_CONFIG_ENV: &str = "SVCVAL_CONFIG";

/// Environment variable naming the kubeconfig to use
pub const SVCVAL_KUBECONFIG_ENV: &str = "SVCVAL_KUBECONFIG";

/// A port every test pod listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: i32,
    pub protocol: Protocol,
}

/// Settings for one `svcval run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Namespace the topology lives in
    pub namespace: String,
    /// Base pods, created in `namespace`
    pub pod_names: Vec<String>,
    /// Ports every base pod listens on
    pub ports: Vec<PortSpec>,
    /// Probes in flight
    pub workers: usize,
    /// Bound for a single connection attempt
    pub probe_timeout_secs: u64,
    /// Wait after node ports are assigned for dataplane rules to land
    pub rules_delay_secs: u64,
    /// Target of ExternalName services
    pub external_domain: String,
    /// Report session affinity drift across ports as a warning
    /// (kubernetes/kubernetes#103000)
    pub tolerate_affinity_port_drift: bool,
    /// Scenarios to run; empty runs the whole catalogue
    pub scenarios: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            namespace: "svcval".to_string(),
            pod_names: ["pod-1", "pod-2", "pod-3", "pod-4"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ports: vec![
                PortSpec { port: 80, protocol: Protocol::Tcp },
                PortSpec { port: 80, protocol: Protocol::Udp },
                PortSpec { port: 81, protocol: Protocol::Tcp },
                PortSpec { port: 81, protocol: Protocol::Udp },
            ],
            workers: svcval_matrix::validator::DEFAULT_WORKERS,
            probe_timeout_secs: 1,
            rules_delay_secs: 5,
            external_domain: "example.com".to_string(),
            tolerate_affinity_port_drift: true,
            scenarios: Vec::new(),
        }
    }
}

impl RunConfig {
    /// Load a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(path, format!("failed to read: {}", e)))?;
        serde_json::from_str(&data).map_err(|e| Error::config(path, e.to_string()))
    }

    /// Load `path` if given, otherwise the defaults
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject settings no run could succeed with
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::validation("namespace must not be empty"));
        }
        if self.pod_names.is_empty() {
            return Err(Error::validation("at least one pod is required"));
        }
        if self.ports.is_empty() {
            return Err(Error::validation("at least one port is required"));
        }
        if let Some(p) = self.ports.iter().find(|p| !(1..=65535).contains(&p.port)) {
            return Err(Error::validation(format!("port {} is out of range", p.port)));
        }
        let mut names = HashSet::new();
        if let Some(name) = self.pod_names.iter().find(|n| !names.insert(n.as_str())) {
            return Err(Error::validation(format!("pod {} is listed twice", name)));
        }
        let mut ports = HashSet::new();
        if let Some(p) = self.ports.iter().find(|p| !ports.insert((p.port, p.protocol))) {
            return Err(Error::validation(format!(
                "port {}/{} is listed twice",
                p.port, p.protocol
            )));
        }
        if self.workers == 0 {
            return Err(Error::validation("workers must be at least 1"));
        }
        if self.probe_timeout_secs == 0 {
            return Err(Error::validation("probe timeout must be at least 1 second"));
        }
        Ok(())
    }

    /// Containers of every base pod
    pub fn containers(&self) -> Vec<Container> {
        self.ports
            .iter()
            .map(|p| Container::new(p.port, p.protocol))
            .collect()
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn rules_delay(&self) -> Duration {
        Duration::from_secs(self.rules_delay_secs)
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            workers: self.workers,
            probe_timeout: self.probe_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_tcp_and_udp_on_two_ports() {
        let config = RunConfig::default();
        assert_eq!(config.pod_names.len(), 4);
        assert_eq!(config.containers().len(), 4);
        assert_eq!(config.containers()[1].name, "cont-80-udp");
        assert!(config.tolerate_affinity_port_drift);
        assert_eq!(config.external_domain, "example.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"namespace": "svc-e2e", "workers": 2, "ports": [{{"port": 8080, "protocol": "TCP"}}]}}"#
        )
        .unwrap();

        let config = RunConfig::resolve(Some(file.path())).unwrap();
        assert_eq!(config.namespace, "svc-e2e");
        assert_eq!(config.workers, 2);
        assert_eq!(config.ports, vec![PortSpec { port: 8080, protocol: Protocol::Tcp }]);
        assert_eq!(config.pod_names, RunConfig::default().pod_names);
        assert_eq!(config.validator_config().workers, 2);
    }

    #[test]
    fn missing_path_means_defaults() {
        assert_eq!(RunConfig::resolve(None).unwrap(), RunConfig::default());
    }

    #[test]
    fn malformed_file_names_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = RunConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ports": [{{"port": 80, "protocol": "QUIC"}}]}}"#).unwrap();
        assert!(RunConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let no_pods = RunConfig {
            pod_names: vec![],
            ..Default::default()
        };
        assert!(no_pods.validate().is_err());

        let no_workers = RunConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(no_workers.validate().is_err());

        let bad_port = RunConfig {
            ports: vec![PortSpec { port: 70000, protocol: Protocol::Udp }],
            ..Default::default()
        };
        assert!(bad_port.validate().unwrap_err().to_string().contains("70000"));
    }

    #[test]
    fn validate_rejects_repeated_pods_and_ports() {
        let twice = RunConfig {
            pod_names: vec!["a".into(), "b".into(), "a".into()],
            ..Default::default()
        };
        assert!(twice.validate().unwrap_err().to_string().contains("pod a"));

        let same_port = RunConfig {
            ports: vec![
                PortSpec { port: 80, protocol: Protocol::Tcp },
                PortSpec { port: 80, protocol: Protocol::Tcp },
            ],
            ..Default::default()
        };
        assert!(same_port.validate().unwrap_err().to_string().contains("80"));

        let both_protocols = RunConfig {
            ports: vec![
                PortSpec { port: 80, protocol: Protocol::Tcp },
                PortSpec { port: 80, protocol: Protocol::Udp },
            ],
            ..Default::default()
        };
        assert!(both_protocols.validate().is_ok());
    }
}
