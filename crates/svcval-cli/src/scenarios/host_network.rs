//! A pod sharing its node's network namespace

use async_trait::async_trait;
use tracing::warn;

use svcval_common::Error;
use svcval_kube::PodReadiness;
use svcval_matrix::{Container, Pod, Protocol, ServiceType};

use super::tcp_port;
use crate::scenario::{Assessment, Scenario, ScenarioContext};

const HOST_POD: &str = "pod-host";

/// Pod-IP reachability with a host-network pod in the topology
pub struct HostNetwork;

#[async_trait]
impl Scenario for HostNetwork {
    fn name(&self) -> &'static str {
        "host-network"
    }

    fn label(&self) -> &'static str {
        "hostNetwork=true"
    }

    fn description(&self) -> &'static str {
        "pods and a host-network pod reach each other by pod IP"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        let port = tcp_port(ctx)?;
        let mut pod = Pod::new(ctx.namespace(), HOST_POD, vec![Container::new(port, Protocol::Tcp)])
            .with_host_network(true);
        match ctx.manager.initialize_pod(&mut pod).await? {
            PodReadiness::Ready => ctx.model.add_pod(pod),
            PodReadiness::Stalled { attempts } => Err(Error::readiness(
                format!("pod/{}", pod.key()),
                "podIP",
                format!("still pending after {} checks", attempts),
            )),
        }
    }

    async fn assess(&mut self, ctx: &mut ScenarioContext) -> Result<Assessment, Error> {
        let port = tcp_port(ctx)?;
        let case = ctx.case(Protocol::Tcp, true, ServiceType::PodIp).with_port(port);
        let report = ctx.validate(case).await?;
        let mut assessment = Assessment::default();
        assessment.expect_no_wrong(&format!("host-network TCP/{}", port), &report);
        Ok(assessment)
    }

    async fn teardown(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        let namespace = ctx.namespace().to_string();
        if ctx.model.find_pod(HOST_POD, &namespace).is_some() {
            ctx.model.remove_pod(HOST_POD, &namespace)?;
        }
        let deleted = ctx.manager.delete_pod(HOST_POD, &namespace).await;
        if let Err(e) = &deleted {
            warn!(pod = HOST_POD, error = %e, "Failed to delete host-network pod");
        }
        ctx.reset_test_board().await?;
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::testing::context;
    use crate::scenario::Outcome;

    #[tokio::test]
    async fn host_pod_joins_the_matrix() {
        let mut ctx = context();
        let mut host = Pod::new("x", HOST_POD, vec![Container::new(80, Protocol::Tcp)])
            .with_host_network(true);
        host.set_pod_ip("172.18.0.2");
        ctx.model.add_pod(host).unwrap();

        let report = ctx
            .validate(ctx.case(Protocol::Tcp, true, ServiceType::PodIp).with_port(80))
            .await
            .unwrap();
        assert_eq!(report.summary.total, 9);

        let assessment = HostNetwork.assess(&mut ctx).await.unwrap();
        assert_eq!(assessment.into_outcome(), Outcome::Passed);
    }
}
