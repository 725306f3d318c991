//! Scenarios over the base topology: one service flavor each

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, warn};

use svcval_common::{Error, POD_LABEL_KEY};
use svcval_kube::templates::{
    cluster_ip_service, load_balancer_service, node_port_service, ServiceTemplate,
};
use svcval_kube::{create_service_from_template, PodReadiness};
use svcval_matrix::{
    establish_affinity, AffinityMap, Container, ExternalIp, Peer, Pod, PodKey, Protocol,
    Reachability, ServiceType, TestCase,
};

use super::{first_pod, pods, probe_ports, tcp_port, track, update_pod};
use crate::scenario::{Assessment, Scenario, ScenarioContext};

/// Assert every pair is reachable through `service_type` for each probed
/// protocol
async fn expect_all_reachable(
    ctx: &ScenarioContext,
    service_type: ServiceType,
) -> Result<Assessment, Error> {
    let mut assessment = Assessment::default();
    for (protocol, port) in probe_ports(ctx) {
        let case = ctx.case(protocol, true, service_type).with_port(port);
        let report = ctx.validate(case).await?;
        assessment.expect_no_wrong(&format!("{} {}/{}", service_type, protocol, port), &report);
    }
    Ok(assessment)
}

/// Node ports assigned to each pod's service, per protocol
#[derive(Debug, Default)]
pub(super) struct NodePorts(Vec<(PodKey, Protocol, i32)>);

impl NodePorts {
    pub(super) fn insert(&mut self, pod: PodKey, protocol: Protocol, node_port: i32) {
        self.0.push((pod, protocol, node_port));
    }

    pub(super) fn get(&self, pod: &PodKey, protocol: Protocol) -> Option<i32> {
        self.0
            .iter()
            .find(|(k, p, _)| k == pod && *p == protocol)
            .map(|(_, _, port)| *port)
    }

    pub(super) fn clear(&mut self) {
        self.0.clear();
    }

    /// Point every pod in the model at its node port for `protocol`
    pub(super) fn apply(&self, ctx: &mut ScenarioContext, protocol: Protocol) {
        for pod in ctx.model.all_pods_mut() {
            if let Some(port) = self.get(&pod.key(), protocol) {
                pod.set_to_port(port);
            }
        }
    }
}

/// Per-pod ClusterIP services
pub struct ClusterIp;

#[async_trait]
impl Scenario for ClusterIp {
    fn name(&self) -> &'static str {
        "cluster-ip"
    }

    fn label(&self) -> &'static str {
        "type=ClusterIP"
    }

    fn description(&self) -> &'static str {
        "every pod reaches every pod through its ClusterIP service"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        for pod in pods(ctx) {
            let mut handle = ctx.service(cluster_ip_service(&pod));
            handle.create().await?;
            let ready = async {
                handle.wait_for_endpoint().await?;
                handle.wait_for_cluster_ip().await
            }
            .await;
            let ip = track(ctx, handle, ready)?;
            update_pod(ctx, &pod, |p| p.set_cluster_ip(ip));
        }
        Ok(())
    }

    async fn assess(&mut self, ctx: &mut ScenarioContext) -> Result<Assessment, Error> {
        expect_all_reachable(ctx, ServiceType::ClusterIp).await
    }

    async fn teardown(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        ctx.reset_test_board().await
    }
}

/// Per-pod NodePort services
#[derive(Default)]
pub struct NodePort {
    node_ports: NodePorts,
}

#[async_trait]
impl Scenario for NodePort {
    fn name(&self) -> &'static str {
        "node-port"
    }

    fn label(&self) -> &'static str {
        "type=NodePort"
    }

    fn description(&self) -> &'static str {
        "every pod reaches every pod through its node port"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        let ports = probe_ports(ctx);
        for pod in pods(ctx) {
            let mut handle = ctx.service(node_port_service(&pod));
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
            for (protocol, node_port) in track(ctx, handle, ready)? {
                info!(pod = %pod.key(), %protocol, node_port, "Node port assigned");
                self.node_ports.insert(pod.key(), protocol, node_port);
            }
        }
        ctx.pause(ctx.config.rules_delay()).await
    }

    async fn assess(&mut self, ctx: &mut ScenarioContext) -> Result<Assessment, Error> {
        let mut assessment = Assessment::default();
        for (protocol, _) in probe_ports(ctx) {
            self.node_ports.apply(ctx, protocol);
            let report = ctx
                .validate(ctx.case(protocol, true, ServiceType::NodePort))
                .await?;
            assessment.expect_no_wrong(&format!("node-port {}", protocol), &report);
        }
        Ok(assessment)
    }

    async fn teardown(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        self.node_ports.clear();
        ctx.reset_test_board().await
    }
}

/// Per-pod LoadBalancer services, one per protocol
pub struct LoadBalancer;

#[async_trait]
impl Scenario for LoadBalancer {
    fn name(&self) -> &'static str {
        "load-balancer"
    }

    fn label(&self) -> &'static str {
        "type=LoadBalancer"
    }

    fn description(&self) -> &'static str {
        "every pod reaches every pod through its load balancer address"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        let ports = probe_ports(ctx);
        for pod in pods(ctx) {
            let mut external_ips = Vec::new();
            for (protocol, _) in &ports {
                let mut handle = ctx.service(load_balancer_service(&pod, *protocol));
                handle.create().await?;
                let ready = async {
                    handle.wait_for_endpoint().await?;
                    handle.wait_for_external_ip().await
                }
                .await;
                let ips = track(ctx, handle, ready)?;
                info!(pod = %pod.key(), %protocol, ips = ?ips, "Load balancer ready");
                external_ips.extend(ExternalIp::from_ips(ips, *protocol));
            }
            update_pod(ctx, &pod, |p| p.set_external_ips(external_ips));
        }
        Ok(())
    }

    async fn assess(&mut self, ctx: &mut ScenarioContext) -> Result<Assessment, Error> {
        expect_all_reachable(ctx, ServiceType::LoadBalancer).await
    }

    async fn teardown(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        ctx.reset_test_board().await
    }
}

/// A service with no selector, and therefore no endpoints
pub struct Endless;

#[async_trait]
impl Scenario for Endless {
    fn name(&self) -> &'static str {
        "endless"
    }

    fn label(&self) -> &'static str {
        "type=ClusterIP,endpoints=none"
    }

    fn description(&self) -> &'static str {
        "nothing is reachable through a service without endpoints"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        let template = ServiceTemplate {
            name: "endless".to_string(),
            namespace: ctx.namespace().to_string(),
            protocol_ports: vec![(Protocol::Tcp, tcp_port(ctx)?)],
            ..Default::default()
        };
        let (_, handle, ip) =
            create_service_from_template(ctx.manager.client(), &template, ctx.manager.wait_config())
                .await?;
        ctx.services.push(handle);
        for pod in ctx.model.all_pods_mut() {
            pod.set_cluster_ip(ip.clone());
        }
        Ok(())
    }

    async fn assess(&mut self, ctx: &mut ScenarioContext) -> Result<Assessment, Error> {
        let port = tcp_port(ctx)?;
        let mut case = ctx.case(Protocol::Tcp, true, ServiceType::ClusterIp).with_port(port);
        let ns = Peer::namespace(ctx.namespace());
        case.reachability.expect_peer(&ns, &ns, false);

        let report = ctx.validate(case).await?;
        let mut assessment = Assessment::default();
        assessment.expect_no_wrong(&format!("endless TCP/{}", port), &report);
        Ok(assessment)
    }

    async fn teardown(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        ctx.reset_test_board().await
    }
}

/// A pod reaching itself through a service that selects only it
pub struct Hairpin;

#[async_trait]
impl Scenario for Hairpin {
    fn name(&self) -> &'static str {
        "hairpin"
    }

    fn label(&self) -> &'static str {
        "type=ClusterIP,hairpin=true"
    }

    fn description(&self) -> &'static str {
        "the first pod reaches itself through a service by DNS name"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        let target = first_pod(ctx)?;
        let template = ServiceTemplate {
            name: "hairpin".to_string(),
            namespace: ctx.namespace().to_string(),
            selector: BTreeMap::from([(POD_LABEL_KEY.to_string(), target.name.clone())]),
            protocol_ports: vec![(Protocol::Tcp, tcp_port(ctx)?)],
            ..Default::default()
        };
        let (name, handle, _) =
            create_service_from_template(ctx.manager.client(), &template, ctx.manager.wait_config())
                .await?;
        let ready = handle.wait_for_endpoint().await;
        track(ctx, handle, ready)?;
        update_pod(ctx, &target, |p| p.set_service_name(name));
        Ok(())
    }

    async fn assess(&mut self, ctx: &mut ScenarioContext) -> Result<Assessment, Error> {
        let port = tcp_port(ctx)?;
        let target = first_pod(ctx)?;
        let mut case = ctx.case(Protocol::Tcp, false, ServiceType::ClusterIp).with_port(port);
        case.reachability.expect_peer(
            &Peer::namespace(ctx.namespace()),
            &Peer::pod(&target.namespace, &target.name),
            true,
        );

        let report = ctx.validate(case).await?;
        let mut assessment = Assessment::default();
        assessment.expect_no_wrong(&format!("hairpin TCP/{}", port), &report);
        Ok(assessment)
    }

    async fn teardown(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        ctx.reset_test_board().await
    }
}

const AFFINITY_PODS: [&str; 2] = ["paf-0", "paf-1"];
const AFFINITY_LABEL: (&str, &str) = ("app", "test-session-affinity");
const AFFINITY_SERVICE: &str = "service-session-affinity";
const AFFINITY_PORTS: [i32; 2] = [80, 81];
const AFFINITY_REPEATS: usize = 3;

/// Expect each source to keep reaching the backend that first answered it
fn affinity_case(
    pods: &[Pod],
    namespace: &str,
    affinity: &AffinityMap,
    port: i32,
) -> Result<TestCase, Error> {
    let mut reachability = Reachability::new(pods, false);
    for (source, endpoint) in affinity {
        reachability.expect(
            &PodKey::new(namespace, source),
            &PodKey::new(namespace, endpoint),
            true,
        )?;
    }
    Ok(TestCase::new(Protocol::Tcp, reachability, ServiceType::ClusterIp)
        .with_port(port)
        .session_affinity())
}

/// ClientIP session affinity over two dedicated backends
#[derive(Default)]
pub struct SessionAffinity {
    backends: Vec<PodKey>,
}

#[async_trait]
impl Scenario for SessionAffinity {
    fn name(&self) -> &'static str {
        "session-affinity"
    }

    fn label(&self) -> &'static str {
        "type=ClusterIP,sessionAffinity=ClientIP"
    }

    fn description(&self) -> &'static str {
        "every pod keeps reaching the same backend across repeated probes"
    }

    async fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        let namespace = ctx.namespace().to_string();
        let containers: Vec<Container> = AFFINITY_PORTS
            .iter()
            .map(|port| Container::new(*port, Protocol::Tcp))
            .collect();

        for name in AFFINITY_PODS {
            let mut pod = Pod::new(&namespace, name, containers.clone())
                .with_label(AFFINITY_LABEL.0, AFFINITY_LABEL.1);
            self.backends.push(pod.key());
            if let PodReadiness::Stalled { attempts } = ctx.manager.initialize_pod(&mut pod).await? {
                return Err(Error::readiness(
                    format!("pod/{}", pod.key()),
                    "podIP",
                    format!("still pending after {} checks", attempts),
                ));
            }
            ctx.model.add_pod(pod)?;
        }

        let template = ServiceTemplate {
            name: AFFINITY_SERVICE.to_string(),
            namespace,
            selector: BTreeMap::from([(AFFINITY_LABEL.0.to_string(), AFFINITY_LABEL.1.to_string())]),
            session_affinity: true,
            protocol_ports: AFFINITY_PORTS.iter().map(|port| (Protocol::Tcp, *port)).collect(),
        };
        let (_, handle, ip) =
            create_service_from_template(ctx.manager.client(), &template, ctx.manager.wait_config())
                .await?;
        let ready = handle.wait_for_endpoint().await;
        track(ctx, handle, ready)?;
        for pod in ctx.model.all_pods_mut() {
            pod.set_cluster_ip(ip.clone());
        }
        Ok(())
    }

    async fn assess(&mut self, ctx: &mut ScenarioContext) -> Result<Assessment, Error> {
        let sources = pods(ctx);
        let [sticky_port, drift_port] = AFFINITY_PORTS;
        let vip = sources
            .first()
            .and_then(|p| p.cluster_ip())
            .map(str::to_string)
            .ok_or_else(|| Error::validation("session affinity service has no cluster IP"))?;

        let affinity = establish_affinity(
            ctx.prober.as_ref(),
            &sources,
            &vip,
            sticky_port,
            Protocol::Tcp,
            ctx.config.probe_timeout(),
        )
        .await?;
        info!(pairs = ?affinity, "Session affinity established");

        let mut assessment = Assessment::default();
        for round in 1..=AFFINITY_REPEATS {
            let case = affinity_case(&sources, ctx.namespace(), &affinity, sticky_port)?;
            let report = ctx.validate(case).await?;
            assessment.expect_no_wrong(
                &format!("affinity TCP/{} round {}", sticky_port, round),
                &report,
            );
        }

        let case = affinity_case(&sources, ctx.namespace(), &affinity, drift_port)?;
        let report = ctx.validate(case).await?;
        let check = format!("affinity TCP/{}", drift_port);
        if report.wrong > 0 && ctx.config.tolerate_affinity_port_drift {
            warn!(
                check = %check,
                wrong = report.wrong,
                "Affinity not kept across ports, known upstream issue kubernetes/kubernetes#103000"
            );
            assessment.warn(format!(
                "{}: {} pairs drifted from the port {} backend (kubernetes/kubernetes#103000)",
                check, report.wrong, sticky_port
            ));
            if report.is_inconclusive() {
                assessment.fail(format!(
                    "{}: inconclusive, {} probes could not run",
                    check, report.errors
                ));
            }
        } else {
            assessment.expect_no_wrong(&check, &report);
        }
        Ok(assessment)
    }

    async fn teardown(&mut self, ctx: &mut ScenarioContext) -> Result<(), Error> {
        let mut result = ctx.reset_test_board().await;
        for key in self.backends.drain(..) {
            if let Err(e) = ctx.manager.delete_pod(&key.name, &key.namespace).await {
                warn!(pod = %key, error = %e, "Failed to delete affinity backend");
                if result.is_ok() {
                    result = Err(e);
                }
            }
            if ctx.model.get(&key).is_some() {
                ctx.model.remove_pod(&key.name, &key.namespace)?;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::testing::context;

    #[tokio::test]
    async fn node_ports_are_applied_per_protocol() {
        let mut ctx = context();
        let mut ports = NodePorts::default();
        ports.insert(PodKey::new("x", "pod-1"), Protocol::Tcp, 30080);
        ports.insert(PodKey::new("x", "pod-1"), Protocol::Udp, 30081);
        ports.insert(PodKey::new("x", "pod-2"), Protocol::Tcp, 30082);

        ports.apply(&mut ctx, Protocol::Udp);
        assert_eq!(ctx.model.find_pod("pod-1", "x").unwrap().to_port(), Some(30081));
        assert_eq!(ctx.model.find_pod("pod-2", "x").unwrap().to_port(), None);

        ports.apply(&mut ctx, Protocol::Tcp);
        assert_eq!(ctx.model.find_pod("pod-1", "x").unwrap().to_port(), Some(30080));
        assert_eq!(ctx.model.find_pod("pod-2", "x").unwrap().to_port(), Some(30082));
    }

    #[tokio::test]
    async fn affinity_case_pins_each_source() {
        let ctx = context();
        let pods = pods(&ctx);
        let affinity = AffinityMap::from([
            ("pod-1".to_string(), "pod-2".to_string()),
            ("pod-2".to_string(), "pod-2".to_string()),
        ]);
        let case = affinity_case(&pods, "x", &affinity, 81).unwrap();
        assert!(case.session_affinity);
        assert_eq!(case.to_port, Some(81));

        let r = &case.reachability;
        let key = |n: &str| PodKey::new("x", n);
        assert_eq!(r.expected(&key("pod-1"), &key("pod-2")), Some(true));
        assert_eq!(r.expected(&key("pod-1"), &key("pod-1")), Some(false));
        assert_eq!(r.expected(&key("pod-2"), &key("pod-2")), Some(true));
    }

    #[tokio::test]
    async fn affinity_to_unknown_backend_is_an_error() {
        let ctx = context();
        let affinity = AffinityMap::from([("pod-1".to_string(), "elsewhere".to_string())]);
        assert!(affinity_case(&pods(&ctx), "x", &affinity, 80).is_err());
    }

    #[tokio::test]
    async fn hairpin_expects_only_the_target() {
        let mut ctx = context();
        ctx.model
            .find_pod_mut("pod-1", "x")
            .unwrap()
            .set_service_name("hairpin");

        let mut hairpin = Hairpin;
        let assessment = hairpin.assess(&mut ctx).await.unwrap();
        // EchoProber answers for any resolved target, and only pod-1 resolves.
        assert_eq!(assessment.into_outcome(), crate::scenario::Outcome::Passed);
    }

    #[tokio::test]
    async fn endless_expects_nothing_reachable() {
        let mut ctx = context();
        let mut endless = Endless;
        // No cluster IPs are set, so no destination resolves.
        let assessment = endless.assess(&mut ctx).await.unwrap();
        assert_eq!(assessment.into_outcome(), crate::scenario::Outcome::Passed);
    }
}
