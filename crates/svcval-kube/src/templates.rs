//! Pod and service manifests for the test topology
//!
//! Per-pod services are named `s-<namespace>-<pod>` and select their pod by
//! the `pod=<name>` label every test pod carries. Free-standing services
//! (endless, hairpin, session affinity) are described with a
//! [`ServiceTemplate`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container as K8sContainer, ContainerPort, Pod as K8sPod, PodSpec, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use kube::Client;
use tracing::info;

use svcval_common::wait::WaitConfig;
use svcval_common::{Error, MANAGED_BY_LABEL_KEY, MANAGED_BY_SVCVAL, POD_LABEL_KEY};
use svcval_matrix::{Pod, Protocol};

use crate::service::ServiceHandle;

/// Image serving the pod's hostname on every declared port
pub const AGNHOST_IMAGE: &str = "registry.k8s.io/e2e-test-images/agnhost:2.39";

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL_KEY.to_string(), MANAGED_BY_SVCVAL.to_string())])
}

fn pod_selector(pod: &Pod) -> BTreeMap<String, String> {
    BTreeMap::from([(POD_LABEL_KEY.to_string(), pod.name.clone())])
}

/// Name of the per-pod service
pub fn service_name(pod: &Pod) -> String {
    format!("s-{}-{}", pod.namespace, pod.name)
}

fn service_port(port: i32, protocol: Protocol) -> ServicePort {
    ServicePort {
        name: Some(format!("{}-{}", protocol.as_str().to_ascii_lowercase(), port)),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    }
}

/// Pod running one `agnhost serve-hostname` container per declared port
///
/// `serve-hostname` only speaks TCP and UDP.
pub fn pod_manifest(pod: &Pod) -> Result<K8sPod, Error> {
    let mut labels = managed_labels();
    labels.extend(pod_selector(pod));
    labels.extend(pod.labels.clone());

    let containers = pod
        .containers
        .iter()
        .map(|c| {
            let proto_flag = match c.protocol {
                Protocol::Tcp => "--tcp",
                Protocol::Udp => "--udp",
                Protocol::Sctp => {
                    return Err(Error::validation(format!(
                        "pod {} declares SCTP port {}, which serve-hostname cannot serve",
                        pod.key(),
                        c.port
                    )))
                }
            };
            Ok(K8sContainer {
                name: c.name.clone(),
                image: Some(AGNHOST_IMAGE.to_string()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                args: Some(vec![
                    "serve-hostname".to_string(),
                    "--http=false".to_string(),
                    proto_flag.to_string(),
                    "--port".to_string(),
                    c.port.to_string(),
                ]),
                ports: Some(vec![ContainerPort {
                    container_port: c.port,
                    name: Some(format!("serve-{}-{}", c.port, c.protocol.as_str().to_ascii_lowercase())),
                    protocol: Some(c.protocol.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(K8sPod {
        metadata: ObjectMeta {
            name: Some(pod.name.clone()),
            namespace: Some(pod.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            host_network: pod.host_network.then_some(true),
            termination_grace_period_seconds: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn per_pod_service(
    pod: &Pod,
    name: String,
    type_: &str,
    ports: Vec<ServicePort>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(pod.namespace.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            selector: Some(pod_selector(pod)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn all_ports(pod: &Pod) -> Vec<ServicePort> {
    pod.containers
        .iter()
        .map(|c| service_port(c.port, c.protocol))
        .collect()
}

/// ClusterIP service exposing every container port of `pod`
pub fn cluster_ip_service(pod: &Pod) -> Service {
    per_pod_service(pod, service_name(pod), "ClusterIP", all_ports(pod))
}

/// NodePort service exposing every container port of `pod`
pub fn node_port_service(pod: &Pod) -> Service {
    per_pod_service(pod, service_name(pod), "NodePort", all_ports(pod))
}

/// NodePort service that only routes to endpoints on the receiving node
pub fn node_port_local_service(pod: &Pod) -> Service {
    let mut svc = node_port_service(pod);
    if let Some(spec) = svc.spec.as_mut() {
        spec.external_traffic_policy = Some("Local".to_string());
    }
    svc
}

/// LoadBalancer service for the container ports of one protocol
///
/// Services are split per protocol since not every load balancer
/// implementation supports mixed-protocol services.
pub fn load_balancer_service(pod: &Pod, protocol: Protocol) -> Service {
    let ports = pod
        .containers
        .iter()
        .filter(|c| c.protocol == protocol)
        .map(|c| service_port(c.port, c.protocol))
        .collect();
    let name = format!(
        "{}-{}",
        service_name(pod),
        protocol.as_str().to_ascii_lowercase()
    );
    per_pod_service(pod, name, "LoadBalancer", ports)
}

/// ExternalName service aliasing `domain`
pub fn external_name_service(pod: &Pod, domain: &str) -> Service {
    let mut svc = per_pod_service(pod, service_name(pod), "ExternalName", all_ports(pod));
    if let Some(spec) = svc.spec.as_mut() {
        spec.external_name = Some(domain.to_string());
        spec.selector = None;
    }
    svc
}

/// A service not tied to a single test pod
#[derive(Clone, Debug, Default)]
pub struct ServiceTemplate {
    /// Service name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Pod selector; empty means no selector and therefore no endpoints
    pub selector: BTreeMap<String, String>,
    /// Pin each client IP to one backend
    pub session_affinity: bool,
    /// Ports to expose
    pub protocol_ports: Vec<(Protocol, i32)>,
}

impl ServiceTemplate {
    /// ClusterIP service manifest
    pub fn to_service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(managed_labels()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: (!self.selector.is_empty()).then(|| self.selector.clone()),
                session_affinity: self.session_affinity.then(|| "ClientIP".to_string()),
                ports: Some(
                    self.protocol_ports
                        .iter()
                        .map(|(protocol, port)| service_port(*port, *protocol))
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Create a service from a template and wait for its cluster IP
///
/// Returns the service name, its handle (for teardown) and the cluster IP.
pub async fn create_service_from_template(
    client: &Client,
    template: &ServiceTemplate,
    wait: &WaitConfig,
) -> Result<(String, ServiceHandle, String), Error> {
    let mut handle = ServiceHandle::new(client.clone(), template.to_service()).with_wait(wait.clone());
    let created = handle.create().await?;
    let cluster_ip = handle.wait_for_cluster_ip().await?;
    info!(service = %created, cluster_ip = %cluster_ip, "Service created from template");
    Ok((created, handle, cluster_ip))
}
