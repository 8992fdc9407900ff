//! Node drain, similar to `kubectl drain`.
//!
//! The node is cordoned first, then every pod bound to it is evicted (or
//! deleted when the cluster has no eviction API) and awaited until it is gone.
//! DaemonSet pods and static mirror pods are left in place: the DaemonSet
//! controller ignores cordons and mirror pods cannot be controlled.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Pod;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::client::{KubernetesClient, KubernetesConnector};
use crate::error::{is_conflict, is_not_found, is_too_many_requests};
use crate::retry::{RetryConfig, retry_if};

/// Interval between pod deletion checks and between blocked eviction attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const CORDON_MAX_ATTEMPTS: u32 = 5;
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Cordon and drain `node_name` using a client built for the target cluster.
pub async fn safely_drain_node(
    connector: &dyn KubernetesConnector,
    api_server_url: &str,
    kubeconfig: &str,
    node_name: &str,
    timeout: Duration,
) -> Result<()> {
    let client = connector
        .connect(api_server_url, kubeconfig)
        .await
        .with_context(|| format!("Failed to get Kubernetes client to drain node {}", node_name))?;

    DrainOperation::new(client.as_ref(), node_name, timeout)
        .run()
        .await
}

/// Drain state for one node.
pub struct DrainOperation<'a> {
    client: &'a dyn KubernetesClient,
    node_name: String,
    timeout: Duration,
    poll_interval: Duration,
    cordon_retry: RetryConfig,
    /// Pods resolved when the drain started; not re-listed afterwards.
    pods: Vec<Pod>,
}

impl<'a> DrainOperation<'a> {
    pub fn new(client: &'a dyn KubernetesClient, node_name: &str, timeout: Duration) -> Self {
        Self {
            client,
            node_name: node_name.to_string(),
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cordon_retry: RetryConfig::with_max_attempts(CORDON_MAX_ATTEMPTS),
            pods: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn run(mut self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        self.cordon()
            .await
            .with_context(|| format!("Failed to cordon node {}", self.node_name))?;

        self.pods = self
            .pods_for_deletion()
            .await
            .with_context(|| format!("Failed to list pods on node {}", self.node_name))?;

        if self.pods.is_empty() {
            info!(node = %self.node_name, "No pods to drain");
            return Ok(());
        }

        let use_eviction = self.client.supports_eviction().await.with_context(|| {
            format!("Failed to check eviction support while draining node {}", self.node_name)
        })?;

        info!(
            node = %self.node_name,
            pods = self.pods.len(),
            eviction = use_eviction,
            "Draining node"
        );

        let drained = if use_eviction {
            self.evict_pods(deadline).await
        } else {
            self.delete_pods(deadline).await
        };
        drained.with_context(|| format!("Failed to drain node {}", self.node_name))?;

        info!(node = %self.node_name, "Node drained");
        Ok(())
    }

    async fn cordon(&self) -> Result<()> {
        retry_if(
            &self.cordon_retry,
            "cordon node",
            is_conflict,
            || async {
                let mut node = self.client.get_node(&self.node_name).await?;
                let spec = node.spec.get_or_insert_with(Default::default);
                if spec.unschedulable == Some(true) {
                    debug!(node = %self.node_name, "Node already cordoned");
                    return Ok(());
                }
                spec.unschedulable = Some(true);
                self.client.update_node(&node).await?;
                Ok(())
            },
        )
        .await
    }

    async fn pods_for_deletion(&self) -> Result<Vec<Pod>> {
        let selector = format!("spec.nodeName={}", self.node_name);
        let pods = self.client.list_pods(None, Some(&selector)).await?;
        Ok(filter_pods(pods))
    }

    async fn evict_pods(&self, deadline: Instant) -> Result<()> {
        try_join_all(self.pods.iter().map(|pod| async move {
            if self.evict_pod(pod, deadline).await? {
                self.wait_for_delete(pod, deadline).await?;
            }
            Ok::<_, anyhow::Error>(())
        }))
        .await?;
        Ok(())
    }

    /// Returns false when the pod was already gone.
    async fn evict_pod(&self, pod: &Pod, deadline: Instant) -> Result<bool> {
        loop {
            match self.client.evict_pod(pod).await {
                Ok(()) => return Ok(true),
                Err(e) if is_not_found(&e) => return Ok(false),
                Err(e) if is_too_many_requests(&e) && Instant::now() < deadline => {
                    warn!(
                        pod = %pod_name(pod),
                        node = %self.node_name,
                        "Eviction blocked by a disruption budget, retrying in {}s",
                        self.poll_interval.as_secs()
                    );
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to evict pod {}", pod_name(pod)));
                }
            }
        }
    }

    async fn delete_pods(&self, deadline: Instant) -> Result<()> {
        for pod in &self.pods {
            match self.client.delete_pod(pod).await {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to delete pod {}", pod_name(pod)));
                }
            }
        }

        try_join_all(self.pods.iter().map(|pod| self.wait_for_delete(pod, deadline))).await?;
        Ok(())
    }

    async fn wait_for_delete(&self, pod: &Pod, deadline: Instant) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.client
            .wait_for_delete(pod, self.poll_interval, remaining)
            .await
            .with_context(|| format!("Failed waiting for pod {} to be deleted", pod_name(pod)))
    }
}

/// Drop pods that must not be drained: DaemonSet-controlled and static mirror pods.
pub fn filter_pods(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| {
            let daemonset = pod.metadata.owner_references.as_ref().is_some_and(|refs| {
                refs.iter()
                    .any(|r| r.controller == Some(true) && r.kind == "DaemonSet")
            });
            if daemonset {
                debug!("Skipping DaemonSet pod {}", pod_name(pod));
                return false;
            }

            let mirror = pod
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));
            if mirror {
                debug!("Skipping mirror pod {}", pod_name(pod));
                return false;
            }

            true
        })
        .collect()
}

fn pod_name(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}
