//! Topology model: the pods under test and their per-test network attributes
//!
//! The [`Model`] owns every [`Pod`]. Matrices only reference pods by
//! [`PodKey`], so scenarios are free to add and remove pods between test
//! cases without invalidating anything a matrix holds.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use svcval_common::{Error, CLUSTER_DNS_SUFFIX};

/// Transport protocol of a container port or probe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// SCTP
    Sctp,
}

impl Protocol {
    /// Kubernetes string form (`TCP`, `UDP`, `SCTP`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "SCTP" => Ok(Protocol::Sctp),
            other => Err(Error::validation(format!("unknown protocol: {}", other))),
        }
    }
}

/// A container listening on one port/protocol
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Container name, unique within the pod
    pub name: String,
    /// Listening port
    pub port: i32,
    /// Listening protocol
    pub protocol: Protocol,
}

impl Container {
    /// Create a container named after its port and protocol (`cont-80-tcp`)
    pub fn new(port: i32, protocol: Protocol) -> Self {
        Self {
            name: format!("cont-{}-{}", port, protocol.as_str().to_ascii_lowercase()),
            port,
            protocol,
        }
    }
}

/// An external (load balancer) address bound to a protocol
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIp {
    /// Address as reported by the load balancer (IP or hostname)
    pub ip: String,
    /// Protocol the load balancer forwards
    pub protocol: Protocol,
}

impl ExternalIp {
    /// Tag a list of addresses with a protocol
    pub fn from_ips<I, S>(ips: I, protocol: Protocol) -> Vec<ExternalIp>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ips.into_iter()
            .map(|ip| ExternalIp {
                ip: ip.into(),
                protocol,
            })
            .collect()
    }
}

/// Identity of a pod within the topology
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodKey {
    /// Namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl PodKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A workload under test
///
/// Identity, containers, labels and the host-network flag are fixed when the
/// pod is declared. `pod_ip`/`host_ip` belong to the running pod and are set
/// once it is ready. Everything else is per-test state that scenarios set up
/// and [`Pod::reset`] clears.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pod {
    /// Pod name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Containers, one per listening port/protocol
    pub containers: Vec<Container>,
    /// Extra labels (services select pods by these)
    pub labels: BTreeMap<String, String>,
    /// Whether the pod runs in the node's network namespace
    pub host_network: bool,

    pod_ip: Option<String>,
    host_ip: Option<String>,
    cluster_ip: Option<String>,
    to_port: Option<i32>,
    external_ips: Vec<ExternalIp>,
    service_name: Option<String>,
    local_endpoint: bool,
}

impl Pod {
    /// Declare a pod
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        containers: Vec<Container>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            containers,
            labels: BTreeMap::new(),
            host_network: false,
            pod_ip: None,
            host_ip: None,
            cluster_ip: None,
            to_port: None,
            external_ips: Vec::new(),
            service_name: None,
            local_endpoint: false,
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Run the pod in the host network namespace
    pub fn with_host_network(mut self, host_network: bool) -> Self {
        self.host_network = host_network;
        self
    }

    /// Identity of this pod
    pub fn key(&self) -> PodKey {
        PodKey::new(&self.namespace, &self.name)
    }

    /// First container listening with the given protocol
    pub fn container_for(&self, protocol: Protocol) -> Option<&Container> {
        self.containers.iter().find(|c| c.protocol == protocol)
    }

    /// Container used as the probe source (the first declared one)
    pub fn source_container(&self) -> Option<&Container> {
        self.containers.first()
    }

    /// Pod IP, once the pod is running
    pub fn pod_ip(&self) -> Option<&str> {
        self.pod_ip.as_deref()
    }

    /// Record the pod IP
    pub fn set_pod_ip(&mut self, ip: impl Into<String>) {
        self.pod_ip = Some(ip.into());
    }

    /// Address of the node hosting the pod
    pub fn host_ip(&self) -> Option<&str> {
        self.host_ip.as_deref()
    }

    /// Record the node address
    pub fn set_host_ip(&mut self, ip: impl Into<String>) {
        self.host_ip = Some(ip.into());
    }

    /// Cluster IP of the service fronting this pod in the current test
    pub fn cluster_ip(&self) -> Option<&str> {
        self.cluster_ip.as_deref()
    }

    /// Bind a cluster IP
    pub fn set_cluster_ip(&mut self, ip: impl Into<String>) {
        self.cluster_ip = Some(ip.into());
    }

    /// Destination port override for the current test (e.g. a node port)
    pub fn to_port(&self) -> Option<i32> {
        self.to_port
    }

    /// Set the destination port override
    pub fn set_to_port(&mut self, port: i32) {
        self.to_port = Some(port);
    }

    /// Load balancer addresses fronting this pod
    pub fn external_ips(&self) -> &[ExternalIp] {
        &self.external_ips
    }

    /// Replace the load balancer addresses
    pub fn set_external_ips(&mut self, ips: Vec<ExternalIp>) {
        self.external_ips = ips;
    }

    /// Name of the service bound to this pod in the current test
    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Bind a service name
    pub fn set_service_name(&mut self, name: impl Into<String>) {
        self.service_name = Some(name.into());
    }

    /// Cluster DNS name of the bound service
    pub fn service_dns_name(&self) -> Option<String> {
        self.service_name
            .as_ref()
            .map(|svc| format!("{}.{}.{}", svc, self.namespace, CLUSTER_DNS_SUFFIX))
    }

    /// Whether this pod is the designated backend of a traffic-local service
    pub fn is_local_endpoint(&self) -> bool {
        self.local_endpoint
    }

    /// Mark this pod as the designated traffic-local backend
    pub fn set_local_endpoint(&mut self, local: bool) {
        self.local_endpoint = local;
    }

    /// Clear every per-test attribute
    pub fn reset(&mut self) {
        self.cluster_ip = None;
        self.to_port = None;
        self.external_ips.clear();
        self.service_name = None;
        self.local_endpoint = false;
    }
}

/// The topology: every pod currently taking part in validation
#[derive(Clone, Debug, Default)]
pub struct Model {
    pods: Vec<Pod>,
}

impl Model {
    /// Build the base catalogue: each pod name in each namespace, all with
    /// the same container set
    ///
    /// A name listed twice in a namespace is rejected like any other
    /// duplicate identity.
    pub fn new<N, P>(
        namespaces: &[N],
        pod_names: &[P],
        containers: &[Container],
    ) -> Result<Self, Error>
    where
        N: AsRef<str>,
        P: AsRef<str>,
    {
        let mut model = Self { pods: Vec::new() };
        for ns in namespaces {
            for name in pod_names {
                model.add_pod(Pod::new(ns.as_ref(), name.as_ref(), containers.to_vec()))?;
            }
        }
        Ok(model)
    }

    /// Add a pod; a pod with the same identity must not already exist
    pub fn add_pod(&mut self, pod: Pod) -> Result<(), Error> {
        if self.find_pod(&pod.name, &pod.namespace).is_some() {
            return Err(Error::validation(format!(
                "pod {} already exists in the model",
                pod.key()
            )));
        }
        self.pods.push(pod);
        Ok(())
    }

    /// Remove a pod by identity, returning it
    pub fn remove_pod(&mut self, name: &str, namespace: &str) -> Result<Pod, Error> {
        let idx = self
            .pods
            .iter()
            .position(|p| p.name == name && p.namespace == namespace)
            .ok_or_else(|| {
                Error::validation(format!("pod {}/{} not found in the model", namespace, name))
            })?;
        Ok(self.pods.remove(idx))
    }

    /// Look up a pod
    pub fn find_pod(&self, name: &str, namespace: &str) -> Option<&Pod> {
        self.pods
            .iter()
            .find(|p| p.name == name && p.namespace == namespace)
    }

    /// Look up a pod for mutation
    pub fn find_pod_mut(&mut self, name: &str, namespace: &str) -> Option<&mut Pod> {
        self.pods
            .iter_mut()
            .find(|p| p.name == name && p.namespace == namespace)
    }

    /// Look up a pod by key
    pub fn get(&self, key: &PodKey) -> Option<&Pod> {
        self.find_pod(&key.name, &key.namespace)
    }

    /// Every pod, in declaration order
    pub fn all_pods(&self) -> &[Pod] {
        &self.pods
    }

    /// Every pod, mutable
    pub fn all_pods_mut(&mut self) -> impl Iterator<Item = &mut Pod> {
        self.pods.iter_mut()
    }

    /// Distinct namespaces, in declaration order
    pub fn namespaces(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for pod in &self.pods {
            if !seen.contains(&pod.namespace.as_str()) {
                seen.push(pod.namespace.as_str());
            }
        }
        seen
    }

    /// Number of pods
    pub fn len(&self) -> usize {
        self.pods.len()
    }

    /// Whether the model has no pods
    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Clear per-test attributes on every pod, keeping the pod set
    pub fn reset_all_pods(&mut self) {
        for pod in &mut self.pods {
            pod.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn containers() -> Vec<Container> {
        vec![Container::new(80, Protocol::Tcp), Container::new(80, Protocol::Udp)]
    }

    fn model() -> Model {
        Model::new(&["x"], &["pod-1", "pod-2", "pod-3"], &containers()).unwrap()
    }

    #[test]
    fn protocol_parses_case_insensitively() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("Sctp".parse::<Protocol>().unwrap(), Protocol::Sctp);
        assert!("icmp".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Udp.to_string(), "UDP");
    }

    #[test]
    fn container_names_follow_port_and_protocol() {
        assert_eq!(Container::new(81, Protocol::Udp).name, "cont-81-udp");
    }

    #[test]
    fn base_catalogue_spans_namespaces() {
        let m = Model::new(&["x", "y"], &["a", "b"], &containers()).unwrap();
        assert_eq!(m.len(), 4);
        assert_eq!(m.namespaces(), vec!["x", "y"]);
        assert!(m.find_pod("b", "y").is_some());
        assert!(m.find_pod("c", "y").is_none());
    }

    #[test]
    fn repeated_name_in_catalogue_is_rejected() {
        let err = Model::new(&["x"], &["pod-1", "pod-1"], &containers()).unwrap_err();
        assert!(err.to_string().contains("x/pod-1"));

        // The same name in two namespaces is two identities.
        let m = Model::new(&["x", "y"], &["pod-1"], &containers()).unwrap();
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut m = model();
        let err = m
            .add_pod(Pod::new("x", "pod-1", containers()))
            .unwrap_err();
        assert!(err.to_string().contains("x/pod-1"));

        m.add_pod(Pod::new("y", "pod-1", containers())).unwrap();
        assert_eq!(m.len(), 4);
    }

    #[test]
    fn remove_pod_returns_it() {
        let mut m = model();
        let pod = m.remove_pod("pod-2", "x").unwrap();
        assert_eq!(pod.name, "pod-2");
        assert_eq!(m.len(), 2);
        assert!(m.remove_pod("pod-2", "x").is_err());
    }

    #[test]
    fn reset_clears_per_test_state_only() {
        let mut m = model();
        {
            let pod = m.find_pod_mut("pod-1", "x").unwrap();
            pod.set_pod_ip("10.244.1.5");
            pod.set_host_ip("172.18.0.3");
            pod.set_cluster_ip("10.96.0.10");
            pod.set_to_port(30080);
            pod.set_service_name("hairpin");
            pod.set_external_ips(ExternalIp::from_ips(["172.18.255.200"], Protocol::Tcp));
            pod.set_local_endpoint(true);
        }
        m.reset_all_pods();

        let pod = m.find_pod("pod-1", "x").unwrap();
        assert_eq!(pod.pod_ip(), Some("10.244.1.5"));
        assert_eq!(pod.host_ip(), Some("172.18.0.3"));
        assert_eq!(pod.cluster_ip(), None);
        assert_eq!(pod.to_port(), None);
        assert_eq!(pod.service_name(), None);
        assert!(pod.external_ips().is_empty());
        assert!(!pod.is_local_endpoint());
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn service_dns_name_uses_pod_namespace() {
        let mut pod = Pod::new("x", "pod-1", containers());
        assert_eq!(pod.service_dns_name(), None);
        pod.set_service_name("s-x-pod-1");
        assert_eq!(
            pod.service_dns_name().as_deref(),
            Some("s-x-pod-1.x.svc.cluster.local")
        );
    }

    #[test]
    fn container_lookup_by_protocol() {
        let pod = Pod::new("x", "pod-1", containers());
        assert_eq!(pod.container_for(Protocol::Udp).unwrap().name, "cont-80-udp");
        assert!(pod.container_for(Protocol::Sctp).is_none());
        assert_eq!(pod.source_container().unwrap().name, "cont-80-tcp");
    }

    #[test]
    fn protocols_use_kubernetes_spelling() {
        assert_eq!(serde_json::to_string(&Protocol::Udp).unwrap(), "\"UDP\"");
        let parsed: Protocol = serde_json::from_str("\"SCTP\"").unwrap();
        assert_eq!(parsed, Protocol::Sctp);
        assert!(serde_json::from_str::<Protocol>("\"tcp\"").is_err());
    }
}
