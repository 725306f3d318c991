//! Test cases: what to probe and how to interpret the results

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use svcval_common::Error;

use crate::model::{Pod, Protocol};
use crate::reachability::Reachability;

/// How destinations are addressed in a test case
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    /// The destination pod's own IP
    PodIp,
    /// The cluster IP of the service fronting the destination
    ClusterIp,
    /// The node port on the node hosting the destination
    NodePort,
    /// The load balancer address fronting the destination
    LoadBalancer,
    /// The DNS name of an ExternalName service bound to the destination
    ExternalName,
}

impl ServiceType {
    /// Resolve the address to dial for `destination`
    ///
    /// Returns `None` when the destination has no binding for this flavor;
    /// such a destination cannot be reached and is observed as not connected.
    pub fn resolve_target(&self, destination: &Pod, protocol: Protocol) -> Option<String> {
        match self {
            ServiceType::PodIp => destination.pod_ip().map(str::to_string),
            ServiceType::ClusterIp => destination
                .cluster_ip()
                .map(str::to_string)
                .or_else(|| destination.service_dns_name()),
            ServiceType::NodePort => destination.host_ip().map(str::to_string),
            ServiceType::LoadBalancer => destination
                .external_ips()
                .iter()
                .find(|ip| ip.protocol == protocol)
                .map(|ip| ip.ip.clone()),
            ServiceType::ExternalName => destination.service_dns_name(),
        }
    }

    /// Kebab-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::PodIp => "pod-ip",
            ServiceType::ClusterIp => "cluster-ip",
            ServiceType::NodePort => "node-port",
            ServiceType::LoadBalancer => "load-balancer",
            ServiceType::ExternalName => "external-name",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pod-ip" => Ok(ServiceType::PodIp),
            "cluster-ip" => Ok(ServiceType::ClusterIp),
            "node-port" => Ok(ServiceType::NodePort),
            "load-balancer" => Ok(ServiceType::LoadBalancer),
            "external-name" => Ok(ServiceType::ExternalName),
            other => Err(Error::validation(format!("unknown service type: {}", other))),
        }
    }
}

/// One validation run
#[derive(Clone, Debug)]
pub struct TestCase {
    /// Destination port; `None` falls back to each destination's own port
    pub to_port: Option<i32>,
    /// Protocol to probe with
    pub protocol: Protocol,
    /// Expectations
    pub reachability: Reachability,
    /// How destinations are addressed
    pub service_type: ServiceType,
    /// Only designated local endpoints may receive traffic
    pub traffic_local: bool,
    /// A cell only counts as connected when its own destination answered
    pub session_affinity: bool,
}

impl TestCase {
    /// Create a case with no port override and no policy flags
    pub fn new(protocol: Protocol, reachability: Reachability, service_type: ServiceType) -> Self {
        Self {
            to_port: None,
            protocol,
            reachability,
            service_type,
            traffic_local: false,
            session_affinity: false,
        }
    }

    /// Probe a fixed destination port
    pub fn with_port(mut self, port: i32) -> Self {
        self.to_port = Some(port);
        self
    }

    /// Validate in traffic-local mode
    pub fn traffic_local(mut self) -> Self {
        self.traffic_local = true;
        self
    }

    /// Validate in session-affinity mode
    pub fn session_affinity(mut self) -> Self {
        self.session_affinity = true;
        self
    }

    /// Port to dial on `destination`
    ///
    /// The case's port wins, then the destination's per-test port (node
    /// ports, load balancer ports), then its first container port for the
    /// protocol.
    pub fn resolve_port(&self, destination: &Pod) -> Option<i32> {
        self.to_port
            .or_else(|| destination.to_port())
            .or_else(|| destination.container_for(self.protocol).map(|c| c.port))
    }

    /// Address and port to dial on `destination`
    pub fn resolve(&self, destination: &Pod) -> Option<(String, i32)> {
        let address = self.service_type.resolve_target(destination, self.protocol)?;
        let port = self.resolve_port(destination)?;
        Some((address, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Container, ExternalIp};

    fn destination() -> Pod {
        let mut pod = Pod::new(
            "x",
            "pod-2",
            vec![Container::new(80, Protocol::Tcp), Container::new(81, Protocol::Udp)],
        );
        pod.set_pod_ip("10.244.1.7");
        pod.set_host_ip("172.18.0.4");
        pod
    }

    fn case(service_type: ServiceType, protocol: Protocol) -> TestCase {
        TestCase::new(protocol, Reachability::new(&[], true), service_type)
    }

    #[test]
    fn pod_ip_dials_pod_address() {
        let c = case(ServiceType::PodIp, Protocol::Tcp).with_port(80);
        assert_eq!(c.resolve(&destination()), Some(("10.244.1.7".to_string(), 80)));
    }

    #[test]
    fn cluster_ip_prefers_ip_then_service_name() {
        let c = case(ServiceType::ClusterIp, Protocol::Tcp).with_port(80);
        let mut pod = destination();
        assert_eq!(c.resolve(&pod), None);

        pod.set_service_name("hairpin");
        assert_eq!(
            c.resolve(&pod),
            Some(("hairpin.x.svc.cluster.local".to_string(), 80))
        );

        pod.set_cluster_ip("10.96.4.4");
        assert_eq!(c.resolve(&pod), Some(("10.96.4.4".to_string(), 80)));
    }

    #[test]
    fn node_port_dials_host_with_assigned_port() {
        let c = case(ServiceType::NodePort, Protocol::Udp);
        let mut pod = destination();
        assert_eq!(c.resolve(&pod), Some(("172.18.0.4".to_string(), 81)));

        pod.set_to_port(31234);
        assert_eq!(c.resolve(&pod), Some(("172.18.0.4".to_string(), 31234)));
    }

    #[test]
    fn load_balancer_matches_protocol() {
        let mut pod = destination();
        let mut ips = ExternalIp::from_ips(["172.18.255.1"], Protocol::Tcp);
        ips.extend(ExternalIp::from_ips(["172.18.255.2"], Protocol::Udp));
        pod.set_external_ips(ips);
        pod.set_to_port(80);

        let tcp = case(ServiceType::LoadBalancer, Protocol::Tcp);
        let udp = case(ServiceType::LoadBalancer, Protocol::Udp);
        assert_eq!(tcp.resolve(&pod), Some(("172.18.255.1".to_string(), 80)));
        assert_eq!(udp.resolve(&pod), Some(("172.18.255.2".to_string(), 80)));
        assert_eq!(case(ServiceType::LoadBalancer, Protocol::Sctp).resolve(&pod), None);
    }

    #[test]
    fn external_name_requires_bound_service() {
        let c = case(ServiceType::ExternalName, Protocol::Tcp).with_port(80);
        let mut pod = destination();
        assert_eq!(c.resolve(&pod), None);
        pod.set_service_name("s-x-pod-2");
        assert_eq!(
            c.resolve(&pod),
            Some(("s-x-pod-2.x.svc.cluster.local".to_string(), 80))
        );
    }

    #[test]
    fn no_port_for_protocol_means_no_target() {
        let c = case(ServiceType::PodIp, Protocol::Sctp);
        assert_eq!(c.resolve(&destination()), None);
    }

    #[test]
    fn service_type_names_round_trip() {
        for ty in [
            ServiceType::PodIp,
            ServiceType::ClusterIp,
            ServiceType::NodePort,
            ServiceType::LoadBalancer,
            ServiceType::ExternalName,
        ] {
            assert_eq!(ty.as_str().parse::<ServiceType>().unwrap(), ty);
        }
        assert!("headless".parse::<ServiceType>().is_err());
    }

    #[test]
    fn policy_flags_default_off() {
        let c = case(ServiceType::NodePort, Protocol::Tcp);
        assert!(!c.traffic_local && !c.session_affinity);
        let c = c.traffic_local().session_affinity();
        assert!(c.traffic_local && c.session_affinity);
    }
}
