//! Service lifecycle
//!
//! A [`ServiceHandle`] owns one service manifest from creation to deletion.
//! Every network attribute the cluster assigns after creation (endpoints,
//! cluster IP, node port, load balancer address) is read through a bounded
//! wait, so a misbehaving cluster fails the scenario with a readiness error
//! naming the service and attribute instead of hanging the run.

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use svcval_common::wait::{wait_for_attribute, Observation, WaitConfig, WaitOutcome};
use svcval_common::Error;
use svcval_matrix::Protocol;

pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// One service under test
pub struct ServiceHandle {
    api: Api<Service>,
    endpoints: Api<Endpoints>,
    spec: Service,
    name: String,
    namespace: String,
    wait: WaitConfig,
}

impl ServiceHandle {
    /// Wrap a manifest; nothing is sent to the cluster until [`create`](Self::create)
    pub fn new(client: Client, spec: Service) -> Self {
        let namespace = spec.metadata.namespace.clone().unwrap_or_default();
        let name = spec.metadata.name.clone().unwrap_or_default();
        Self {
            api: Api::namespaced(client.clone(), &namespace),
            endpoints: Api::namespaced(client, &namespace),
            spec,
            name,
            namespace,
            wait: WaitConfig::default(),
        }
    }

    /// Override the bounds of every wait on this service
    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The manifest this handle creates
    pub fn spec(&self) -> &Service {
        &self.spec
    }

    fn resource(&self) -> String {
        format!("service/{}/{}", self.namespace, self.name)
    }

    /// Create the service, returning the name the cluster stored it under
    pub async fn create(&mut self) -> Result<String, Error> {
        let created = self.api.create(&PostParams::default(), &self.spec).await?;
        if let Some(name) = created.metadata.name {
            self.name = name;
        }
        info!(service = %self.resource(), "Service created");
        Ok(self.name.clone())
    }

    async fn get(&self) -> Result<Service, Error> {
        Ok(self.api.get(&self.name).await?)
    }

    async fn wait_for<T, F>(&self, attribute: &str, extract: F) -> Result<T, Error>
    where
        F: Fn(&Service) -> Option<T>,
    {
        let resource = self.resource();
        let this = self;
        let extract = &extract;
        let outcome = wait_for_attribute(&resource, attribute, &self.wait, move || async move {
            let svc = this.get().await?;
            Ok(match extract(&svc) {
                Some(value) => Observation::Ready(value),
                None => Observation::Pending,
            })
        })
        .await?;
        match outcome {
            WaitOutcome::Ready(value) => Ok(value),
            WaitOutcome::Stalled { attempts } => Err(Error::readiness(
                resource,
                attribute,
                format!("still pending after {} checks", attempts),
            )),
        }
    }

    /// Wait until at least one ready endpoint address backs the service
    pub async fn wait_for_endpoint(&self) -> Result<(), Error> {
        let resource = self.resource();
        let this = self;
        let outcome = wait_for_attribute(&resource, "endpoints", &self.wait, move || async move {
            let eps = match this.endpoints.get(&this.name).await {
                Ok(eps) => eps,
                Err(e) if is_not_found(&e) => return Ok(Observation::Pending),
                Err(e) => return Err(e.into()),
            };
            let ready = eps
                .subsets
                .iter()
                .flatten()
                .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()));
            Ok(if ready {
                Observation::Ready(())
            } else {
                Observation::Pending
            })
        })
        .await?;
        match outcome {
            WaitOutcome::Ready(()) => Ok(()),
            WaitOutcome::Stalled { attempts } => Err(Error::readiness(
                resource,
                "endpoints",
                format!("still pending after {} checks", attempts),
            )),
        }
    }

    /// Wait for the cluster IP
    pub async fn wait_for_cluster_ip(&self) -> Result<String, Error> {
        self.wait_for("clusterIP", cluster_ip_of).await
    }

    /// Wait for the node port assigned to one service port
    pub async fn wait_for_node_port_of(&self, protocol: Protocol, port: i32) -> Result<i32, Error> {
        self.wait_for("nodePort", move |svc| node_port_for(svc, protocol, port))
            .await
    }

    /// Wait for the load balancer to publish at least one address
    pub async fn wait_for_external_ip(&self) -> Result<Vec<String>, Error> {
        self.wait_for("loadBalancerIngress", external_ips_of).await
    }

    /// Delete the service; a service that is already gone is not an error
    pub async fn delete(&self) -> Result<(), Error> {
        match self.api.delete(&self.name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(service = %self.resource(), "Service deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn cluster_ip_of(svc: &Service) -> Option<String> {
    svc.spec
        .as_ref()
        .and_then(|s| s.cluster_ip.clone())
        .filter(|ip| !ip.is_empty() && ip != "None")
}

fn node_port_for(svc: &Service, protocol: Protocol, port: i32) -> Option<i32> {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .into_iter()
        .flatten()
        .find(|p| p.port == port && p.protocol.as_deref().unwrap_or("TCP") == protocol.as_str())
        .and_then(|p| p.node_port)
        .filter(|node_port| *node_port > 0)
}

/// Published load balancer addresses, taking the hostname where a
/// provider publishes no IP
fn external_ips_of(svc: &Service) -> Option<Vec<String>> {
    let ips: Vec<String> = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|ingress| {
            ingress
                .ip
                .clone()
                .filter(|ip| !ip.is_empty())
                .or_else(|| ingress.hostname.clone().filter(|h| !h.is_empty()))
        })
        .collect();
    (!ips.is_empty()).then_some(ips)
}

/// Services created by one scenario
#[derive(Default)]
pub struct Services {
    handles: Vec<ServiceHandle>,
}

impl Services {
    /// Empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a service for teardown
    pub fn push(&mut self, handle: ServiceHandle) {
        self.handles.push(handle);
    }

    /// Number of tracked services
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Delete every tracked service
    ///
    /// Attempts every deletion and returns the first failure.
    pub async fn delete_all(&mut self) -> Result<(), Error> {
        let mut first_error = None;
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.delete().await {
                warn!(service = %handle.name(), error = %e, "Failed to delete service");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServicePort, ServiceSpec, ServiceStatus,
    };

    #[test]
    fn headless_or_unassigned_cluster_ip_is_pending() {
        let mut svc = Service::default();
        assert_eq!(cluster_ip_of(&svc), None);

        svc.spec = Some(ServiceSpec {
            cluster_ip: Some("None".into()),
            ..Default::default()
        });
        assert_eq!(cluster_ip_of(&svc), None);

        svc.spec = Some(ServiceSpec {
            cluster_ip: Some("10.96.12.3".into()),
            ..Default::default()
        });
        assert_eq!(cluster_ip_of(&svc).as_deref(), Some("10.96.12.3"));
    }

    #[test]
    fn node_port_matches_protocol_and_port() {
        let svc = Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![
                    ServicePort {
                        port: 80,
                        node_port: Some(31080),
                        ..Default::default()
                    },
                    ServicePort {
                        port: 81,
                        node_port: Some(31081),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(node_port_for(&svc, Protocol::Tcp, 80), Some(31080));
        assert_eq!(node_port_for(&Service::default(), Protocol::Tcp, 80), None);
        assert_eq!(node_port_for(&svc, Protocol::Tcp, 81), Some(31081));
        assert_eq!(node_port_for(&svc, Protocol::Udp, 81), None);
    }

    #[test]
    fn hostname_only_ingress_publishes_its_hostname() {
        let mut svc = Service {
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        hostname: Some("lb.example.com".into()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(external_ips_of(&svc), Some(vec!["lb.example.com".to_string()]));

        if let Some(status) = svc.status.as_mut() {
            status.load_balancer = Some(LoadBalancerStatus {
                ingress: Some(vec![
                    LoadBalancerIngress {
                        ip: Some("172.18.255.200".into()),
                        hostname: Some("lb.example.com".into()),
                        ..Default::default()
                    },
                    LoadBalancerIngress::default(),
                ]),
            });
        }
        assert_eq!(external_ips_of(&svc), Some(vec!["172.18.255.200".to_string()]));

        if let Some(status) = svc.status.as_mut() {
            status.load_balancer = Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress::default()]),
            });
        }
        assert_eq!(external_ips_of(&svc), None);
    }
}
