//! Scenarios where traffic enters from outside the service's own routing:
//! node-local node ports and DNS aliases to external names

use async_trait::async_trait;
use tracing::info;

use svcval_common::Error;
use svcval_kube::templates::{external_name_service, node_port_local_service};
use svcval_matrix::{Protocol, ServiceType};

use super::basic::NodePorts;
use super::{first_pod, pods, probe_ports, tcp_port, track, update_pod};
use crate::scenario::{Assessment, Scenario, ScenarioContext};

/// NodePort service with external traffic policy Local for the first pod
///
/// Only the first pod is selected, so only node ports on its node have a
/// local endpoint. Every pod on that node is a designated endpoint: dialing
/// its host IP lands on the same node.
#[derive(Default)]
pub struct NodePortLocal {
    node_ports: NodePorts,
}

#[async_trait]
impl Scenario for NodePortLocal {
    fn name(&self) -> &'static str {
        "node-port-local"
    }

    fn label(&self) -> &'static str {
        "type=NodePort,externalTrafficPolicy=Local"
    }

    fn description(&self) -> &'static str {
        "a local-traffic node port only answers on the node hosting its endpoint"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        let target = first_pod(ctx)?;
        let host_ip = target
            .host_ip()
            .map(str::to_string)
            .ok_or_else(|| Error::validation(format!("pod {} has no host IP", target.key())))?;

        let ports = probe_ports(ctx);
        let mut handle = ctx.service(node_port_local_service(&target));
        handle.create().await?;
        let ready = async {
            handle.wait_for_endpoint().await?;
            let mut assigned = Vec::with_capacity(ports.len());
            for (protocol, port) in &ports {
                assigned.push((*protocol, handle.wait_for_node_port_of(*protocol, *port).await?));
            }
            Ok::<_, Error>(assigned)
        }
        .await;
        let assigned = track(ctx, handle, ready)?;

        for pod in ctx.model.all_pods_mut() {
            for (protocol, node_port) in &assigned {
                self.node_ports.insert(pod.key(), *protocol, *node_port);
            }
            if pod.host_ip() == Some(host_ip.as_str()) {
                info!(pod = %pod.key(), host_ip = %host_ip, "Designated local endpoint");
                pod.set_local_endpoint(true);
            }
        }
        ctx.pause(ctx.config.rules_delay()).await
    }

    async fn assess(&mut self, ctx: &mut ScenarioContext) -> Result<Assessment, Error> {
        let mut assessment = Assessment::default();
        for (protocol, _) in probe_ports(ctx) {
            self.node_ports.apply(ctx, protocol);
            let case = ctx.case(protocol, true, ServiceType::NodePort).traffic_local();
            let report = ctx.validate(case).await?;
            assessment.expect_no_wrong(&format!("node-port-local {}", protocol), &report);
        }
        Ok(assessment)
    }

    async fn teardown(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        self.node_ports.clear();
        ctx.reset_test_board().await
    }
}

/// Per-pod ExternalName services aliasing the configured domain
pub struct ExternalName;

#[async_trait]
impl Scenario for ExternalName {
    fn name(&self) -> &'static str {
        "external-name"
    }

    fn label(&self) -> &'static str {
        "type=ExternalName"
    }

    fn description(&self) -> &'static str {
        "every pod resolves and reaches the external domain through each alias"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        let domain = ctx.config.external_domain.clone();
        for pod in pods(ctx) {
            let mut handle = ctx.service(external_name_service(&pod, &domain));
            let created = handle.create().await;
            let name = track(ctx, handle, created)?;
            update_pod(ctx, &pod, |p| p.set_service_name(name));
        }
        Ok(())
    }

    async fn assess(&mut self, ctx: &mut ScenarioContext) -> Result<Assessment, Error> {
        let port = tcp_port(ctx)?;
        let case = ctx.case(Protocol::Tcp, true, ServiceType::ExternalName).with_port(port);
        let report = ctx.validate(case).await?;
        let mut assessment = Assessment::default();
        assessment.expect_no_wrong(&format!("external-name TCP/{}", port), &report);
        Ok(assessment)
    }

    async fn teardown(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        ctx.reset_test_board().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortSpec;
    use crate::scenario::testing::context;
    use crate::scenario::Outcome;
    use svcval_matrix::PodKey;

    #[tokio::test]
    async fn only_designated_pods_may_answer() {
        let mut ctx = context();
        ctx.config.ports = vec![PortSpec {
            port: 80,
            protocol: Protocol::Tcp,
        }];
        for pod in ctx.model.all_pods_mut() {
            pod.set_host_ip(format!("172.18.0.{}", pod.name.len()));
        }
        ctx.model.find_pod_mut("pod-1", "x").unwrap().set_local_endpoint(true);

        let mut scenario = NodePortLocal::default();
        for key in [PodKey::new("x", "pod-1"), PodKey::new("x", "pod-2")] {
            scenario.node_ports.insert(key, Protocol::Tcp, 30080);
        }

        // EchoProber connects everywhere, so pod-2 answering is a mismatch.
        let assessment = scenario.assess(&mut ctx).await.unwrap();
        match assessment.into_outcome() {
            Outcome::Failed(reasons) => {
                assert_eq!(reasons, vec!["node-port-local TCP: 2 wrong".to_string()])
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn aliases_resolve_by_service_name() {
        let mut ctx = context();
        for pod in ctx.model.all_pods_mut() {
            let name = format!("s-x-{}", pod.name);
            pod.set_service_name(name);
        }
        let assessment = ExternalName.assess(&mut ctx).await.unwrap();
        assert_eq!(assessment.into_outcome(), Outcome::Passed);
    }
}
