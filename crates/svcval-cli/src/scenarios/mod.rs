//! Scenario catalogue
//!
//! | name               | exercises                                        |
//! |--------------------|--------------------------------------------------|
//! | `cluster-ip`       | per-pod ClusterIP services, TCP and UDP          |
//! | `node-port`        | per-pod NodePort services, TCP and UDP           |
//! | `load-balancer`    | per-pod LoadBalancer services, one per protocol  |
//! | `endless`          | a service with no endpoints                      |
//! | `hairpin`          | a pod reaching itself through its own service    |
//! | `session-affinity` | ClientIP affinity across repeated probes         |
//! | `node-port-local`  | NodePort with external traffic policy Local      |
//! | `external-name`    | ExternalName services                            |
//! | `host-network`     | a pod in the node network namespace              |

mod basic;
mod external;
mod host_network;

pub use basic::{ClusterIp, Endless, Hairpin, LoadBalancer, NodePort, SessionAffinity};
pub use external::{ExternalName, NodePortLocal};
pub use host_network::HostNetwork;

use svcval_common::Error;
use svcval_kube::ServiceHandle;
use svcval_matrix::{Pod, Protocol};

use crate::scenario::{Scenario, ScenarioContext};

/// Every scenario, in run order
pub fn catalogue() -> Vec<Box<dyn Scenario>> {
    vec![
        Box::new(ClusterIp),
        Box::new(NodePort::default()),
        Box::new(LoadBalancer),
        Box::new(Endless),
        Box::new(Hairpin),
        Box::new(SessionAffinity::default()),
        Box::new(NodePortLocal::default()),
        Box::new(ExternalName),
        Box::new(HostNetwork),
    ]
}

/// Scenarios named in `names`, in catalogue order; empty selects all
pub fn select(names: &[String]) -> crate::Result<Vec<Box<dyn Scenario>>> {
    let all = catalogue();
    if let Some(unknown) = names
        .iter()
        .find(|n| !all.iter().any(|s| s.name() == n.as_str()))
    {
        return Err(crate::Error::UnknownScenario {
            name: unknown.clone(),
        });
    }
    Ok(all
        .into_iter()
        .filter(|s| names.is_empty() || names.iter().any(|n| n == s.name()))
        .collect())
}

/// Keep `handle` for teardown whatever `ready` returned
///
/// A service that was created but never became ready still has to be
/// deleted, so the handle is tracked before the readiness result is
/// propagated.
fn track<T>(ctx: &mut ScenarioContext, handle: ServiceHandle, ready: Result<T, Error>) -> Result<T, Error> {
    ctx.services.push(handle);
    ready
}

/// First configured port per probed protocol, TCP before UDP
fn probe_ports(ctx: &ScenarioContext) -> Vec<(Protocol, i32)> {
    [Protocol::Tcp, Protocol::Udp]
        .into_iter()
        .filter_map(|protocol| {
            ctx.config
                .ports
                .iter()
                .find(|p| p.protocol == protocol)
                .map(|p| (protocol, p.port))
        })
        .collect()
}

/// First configured TCP port
fn tcp_port(ctx: &ScenarioContext) -> Result<i32, Error> {
    probe_ports(ctx)
        .into_iter()
        .find(|(protocol, _)| *protocol == Protocol::Tcp)
        .map(|(_, port)| port)
        .ok_or_else(|| Error::validation("no TCP port configured"))
}

/// Snapshot of the model pods, so services can be created while the model
/// is updated
fn pods(ctx: &ScenarioContext) -> Vec<Pod> {
    ctx.model.all_pods().to_vec()
}

fn first_pod(ctx: &ScenarioContext) -> Result<Pod, Error> {
    ctx.model
        .all_pods()
        .first()
        .cloned()
        .ok_or_else(|| Error::validation("topology has no pods"))
}

fn update_pod(ctx: &mut ScenarioContext, pod: &Pod, f: impl FnOnce(&mut Pod)) {
    if let Some(p) = ctx.model.find_pod_mut(&pod.name, &pod.namespace) {
        f(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_names_are_unique() {
        let names: Vec<&str> = catalogue().iter().map(|s| s.name()).collect();
        let mut deduped = names.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
        assert_eq!(names.len(), 9);
    }

    #[test]
    fn empty_selection_runs_everything() {
        assert_eq!(select(&[]).unwrap().len(), catalogue().len());
    }

    #[test]
    fn selection_keeps_catalogue_order() {
        let picked = select(&["hairpin".into(), "cluster-ip".into()]).unwrap();
        let names: Vec<&str> = picked.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["cluster-ip", "hairpin"]);
    }

    #[tokio::test]
    async fn probes_first_port_of_each_protocol() {
        use crate::config::PortSpec;

        let mut ctx = crate::scenario::testing::context();
        assert_eq!(probe_ports(&ctx), vec![(Protocol::Tcp, 80), (Protocol::Udp, 80)]);

        ctx.config.ports = vec![
            PortSpec { port: 8081, protocol: Protocol::Udp },
            PortSpec { port: 8080, protocol: Protocol::Udp },
        ];
        assert_eq!(probe_ports(&ctx), vec![(Protocol::Udp, 8081)]);
        assert!(tcp_port(&ctx).is_err());
    }

    #[test]
    fn unknown_scenario_is_an_error() {
        let err = select(&["headless".into()]).err().unwrap();
        assert!(matches!(err, crate::Error::UnknownScenario { ref name } if name == "headless"));
    }
}
