//! Namespace and pod lifecycle for the test topology
//!
//! The [`Manager`] turns model pods into running pods and writes back the
//! addresses the cluster assigned. Pods that stay `Pending` past the stall
//! threshold (typically no schedulable node because of taints) are reported
//! as stalled so the caller can drop them from the model instead of failing
//! the whole run.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, Pod as K8sPod};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use svcval_common::wait::{
    wait_for_attribute, Observation, WaitConfig, WaitOutcome, DEFAULT_STALL_THRESHOLD,
};
use svcval_common::{Error, FIELD_MANAGER, MANAGED_BY_LABEL_KEY, MANAGED_BY_SVCVAL};
use svcval_matrix::{Model, Pod, PodKey};

use crate::service::is_not_found;
use crate::templates::pod_manifest;

/// Result of bringing up one pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodReadiness {
    /// Running with addresses recorded on the model pod
    Ready,
    /// Still pending after the stall threshold
    Stalled {
        /// Pending observations before giving up
        attempts: u32,
    },
}

/// Addresses of a running pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodAddresses {
    /// Pod IP
    pub pod_ip: String,
    /// IP of the node the pod runs on
    pub host_ip: String,
}

/// Readiness of a pod as seen by one poll
pub fn observe_pod(pod: &K8sPod) -> Observation<PodAddresses> {
    let Some(status) = pod.status.as_ref() else {
        return Observation::Pending;
    };
    match status.phase.as_deref() {
        Some("Running") => {
            let all_ready = status
                .container_statuses
                .as_ref()
                .is_some_and(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready));
            match (all_ready, status.pod_ip.clone(), status.host_ip.clone()) {
                (true, Some(pod_ip), Some(host_ip)) => {
                    Observation::Ready(PodAddresses { pod_ip, host_ip })
                }
                _ => Observation::Pending,
            }
        }
        Some(phase @ ("Failed" | "Succeeded")) => Observation::Failed(format!(
            "pod terminated in phase {}{}",
            phase,
            status
                .message
                .as_deref()
                .map(|m| format!(": {}", m))
                .unwrap_or_default()
        )),
        _ => Observation::Pending,
    }
}

/// Creates and tears down the test topology
pub struct Manager {
    client: Client,
    wait: WaitConfig,
}

impl Manager {
    /// Create a manager using `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            wait: WaitConfig::with_stall_threshold(DEFAULT_STALL_THRESHOLD),
        }
    }

    /// Override the bounds of pod readiness waits
    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    /// The client used for every call
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Bounds applied to pod readiness waits
    pub fn wait_config(&self) -> &WaitConfig {
        &self.wait
    }

    /// Ensure the namespace exists (idempotent, server-side apply)
    pub async fn init_namespace(&self, namespace: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let labels = BTreeMap::from([(MANAGED_BY_LABEL_KEY, MANAGED_BY_SVCVAL)]);
        let ns = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": namespace,
                "labels": labels
            }
        });
        api.patch(namespace, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&ns))
            .await?;
        info!(namespace, "Namespace ready");
        Ok(())
    }

    /// Delete the namespace and everything in it
    pub async fn delete_namespace(&self, namespace: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(namespace, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace, "Namespace deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), Error> {
        let api: Api<K8sPod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let manifest = pod_manifest(pod)?;
        match api.create(&PostParams::default(), &manifest).await {
            Ok(_) => {
                debug!(pod = %pod.key(), "Pod created");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(pod = %pod.key(), "Pod already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_for_pod(&self, key: &PodKey) -> Result<WaitOutcome<PodAddresses>, Error> {
        let api: Api<K8sPod> = Api::namespaced(self.client.clone(), &key.namespace);
        let resource = format!("pod/{}", key);
        let api = &api;
        let name = key.name.as_str();
        wait_for_attribute(&resource, "podIP", &self.wait, move || async move {
            Ok(observe_pod(&api.get(name).await?))
        })
        .await
    }

    fn record(pod: &mut Pod, outcome: WaitOutcome<PodAddresses>) -> PodReadiness {
        match outcome {
            WaitOutcome::Ready(addresses) => {
                info!(
                    pod = %pod.key(),
                    pod_ip = %addresses.pod_ip,
                    host_ip = %addresses.host_ip,
                    "Pod running"
                );
                pod.set_pod_ip(addresses.pod_ip);
                pod.set_host_ip(addresses.host_ip);
                PodReadiness::Ready
            }
            WaitOutcome::Stalled { attempts } => PodReadiness::Stalled { attempts },
        }
    }

    /// Create a pod, wait for it and record its addresses
    pub async fn initialize_pod(&self, pod: &mut Pod) -> Result<PodReadiness, Error> {
        self.create_pod(pod).await?;
        let outcome = self.wait_for_pod(&pod.key()).await?;
        Ok(Self::record(pod, outcome))
    }

    /// Bring up every pod in the model
    ///
    /// All pods are created before any wait starts. Stalled pods are deleted
    /// and removed from the model; their keys are returned.
    pub async fn initialize_model(&self, model: &mut Model) -> Result<Vec<PodKey>, Error> {
        for pod in model.all_pods() {
            self.create_pod(pod).await?;
        }

        let keys: Vec<PodKey> = model.all_pods().iter().map(Pod::key).collect();
        let mut stalled = Vec::new();
        for key in keys {
            let outcome = self.wait_for_pod(&key).await?;
            let Some(pod) = model.find_pod_mut(&key.name, &key.namespace) else {
                continue;
            };
            if let PodReadiness::Stalled { attempts } = Self::record(pod, outcome) {
                warn!(
                    pod = %key,
                    attempts,
                    "Pod stuck pending, removing it from the topology"
                );
                self.delete_pod(&key.name, &key.namespace).await?;
                model.remove_pod(&key.name, &key.namespace)?;
                stalled.push(key);
            }
        }

        info!(pods = model.len(), stalled = stalled.len(), "Topology initialized");
        Ok(stalled)
    }

    /// Delete a pod; a pod that is already gone is not an error
    pub async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<K8sPod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(pod = %format!("{}/{}", namespace, name), "Pod deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
