//! Cluster-autoscaler pause/resume.
//!
//! The autoscaler is paused by scaling its deployment to zero so it does not
//! add or remove agent VMs while they are being replaced.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use super::client::KubernetesClient;
use crate::error::AkupError;
use crate::retry::RetryConfig;

pub const CLUSTER_AUTOSCALER_NAMESPACE: &str = "kube-system";
pub const CLUSTER_AUTOSCALER_NAME: &str = "cluster-autoscaler";

/// Retry policy for the replica update: ten attempts, five seconds apart.
pub fn default_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 10,
        initial_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(5),
        backoff_multiplier: 1.0,
    }
}

/// Set the cluster-autoscaler replica count and return the count it had before.
///
/// Both the read and the write are retried, so a conflicting writer or a
/// transient API failure does not abort the upgrade.
pub async fn set_cluster_autoscaler_replica_count(
    client: Option<&dyn KubernetesClient>,
    replicas: i32,
    retry: &RetryConfig,
) -> Result<i32> {
    let client = client.ok_or(AkupError::NoKubernetesClient)?;
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if attempt > 1 {
            info!(
                attempt = attempt,
                max_attempts = max_attempts,
                "Retry updating cluster-autoscaler"
            );
        }

        match update_replicas(client, replicas).await {
            Ok(previous) => {
                info!(
                    previous = previous,
                    replicas = replicas,
                    "Set cluster-autoscaler replicas"
                );
                return Ok(previous);
            }
            Err(e) if attempt < max_attempts => {
                warn!(attempt = attempt, "Failed to update cluster-autoscaler: {:#}", e);
                tokio::time::sleep(retry.delay_for(attempt)).await;
            }
            Err(e) => {
                warn!(attempt = attempt, "Failed to update cluster-autoscaler: {:#}", e);
                return Err(e);
            }
        }
    }
}

async fn update_replicas(client: &dyn KubernetesClient, replicas: i32) -> Result<i32> {
    let mut deployment = client
        .get_deployment(CLUSTER_AUTOSCALER_NAMESPACE, CLUSTER_AUTOSCALER_NAME)
        .await?;

    let spec = deployment.spec.get_or_insert_with(Default::default);
    let previous = spec.replicas.unwrap_or(1);
    spec.replicas = Some(replicas);

    client
        .update_deployment(CLUSTER_AUTOSCALER_NAMESPACE, &deployment)
        .await?;
    Ok(previous)
}
