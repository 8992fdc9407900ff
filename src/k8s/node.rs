//! Node readiness and metadata carry-over for replaced VMs.

use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node;
use tokio::time::Instant;
use tracing::{debug, info};

use super::client::KubernetesClient;
use crate::error::{AkupError, is_conflict};
use crate::retry::{RetryConfig, retry_if};

/// Returns true if the node reports a `Ready=True` condition.
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Poll until `node_name` is registered and Ready.
pub async fn wait_for_node_ready(
    client: &dyn KubernetesClient,
    node_name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<Node> {
    let start = Instant::now();

    loop {
        match client.get_node(node_name).await {
            Ok(node) if is_node_ready(&node) => {
                info!(node = node_name, "Node is ready");
                return Ok(node);
            }
            Ok(_) => debug!(node = node_name, "Node registered but not ready"),
            Err(e) => debug!(node = node_name, "Node not available yet: {}", e),
        }

        if start.elapsed() > timeout {
            return Err(AkupError::Timeout {
                operation: format!("node {} to become ready", node_name),
                details: format!("exceeded {}s", timeout.as_secs()),
            }
            .into());
        }
        tokio::time::sleep(interval).await;
    }
}

/// Whether a label, annotation or taint key is owned by Kubernetes or the cloud provider.
///
/// Keys under `kubernetes.io`, `k8s.io` or `kubernetes.azure.com` (including
/// subdomains such as `node-role.kubernetes.io`) are managed by the platform.
pub fn is_reserved_key(key: &str) -> bool {
    let Some((domain, _)) = key.split_once('/') else {
        return false;
    };
    ["kubernetes.io", "k8s.io", "kubernetes.azure.com"]
        .iter()
        .any(|managed| domain == *managed || domain.ends_with(&format!(".{}", managed)))
}

/// Copy custom labels, annotations and taints from `old` onto `new`.
///
/// Reserved keys are skipped and keys already present on `new` keep their
/// value. Returns true if `new` changed.
pub fn copy_custom_node_properties(old: &Node, new: &mut Node) -> bool {
    let mut changed = false;

    let maps = [
        (&old.metadata.labels, &mut new.metadata.labels),
        (&old.metadata.annotations, &mut new.metadata.annotations),
    ];
    for (source, target) in maps {
        let Some(source) = source else { continue };
        let target = target.get_or_insert_with(Default::default);
        for (key, value) in source {
            if is_reserved_key(key) || target.contains_key(key) {
                continue;
            }
            target.insert(key.clone(), value.clone());
            changed = true;
        }
    }

    let old_taints = old.spec.as_ref().and_then(|s| s.taints.as_ref());
    if let Some(old_taints) = old_taints {
        let spec = new.spec.get_or_insert_with(Default::default);
        let taints = spec.taints.get_or_insert_with(Vec::new);
        for taint in old_taints {
            if is_reserved_key(&taint.key)
                || taints
                    .iter()
                    .any(|t| t.key == taint.key && t.effect == taint.effect)
            {
                continue;
            }
            taints.push(taint.clone());
            changed = true;
        }
    }

    changed
}

/// Re-read the replacement node, merge custom properties from `old` and write it back.
pub async fn copy_custom_properties(
    client: &dyn KubernetesClient,
    old: &Node,
    node_name: &str,
    retry: &RetryConfig,
) -> Result<()> {
    retry_if(retry, "copy node properties", is_conflict, || async {
        let mut node = client.get_node(node_name).await?;
        if copy_custom_node_properties(old, &mut node) {
            client.update_node(&node).await?;
            info!(node = node_name, "Copied custom node properties");
        }
        Ok(())
    })
    .await
    .with_context(|| format!("Failed to copy custom properties to node {}", node_name))
}
