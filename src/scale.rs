//! Agent pool scaling for availability-set clusters.
//!
//! Scaling down drains and deletes the highest-indexed VMs of the pool.
//! Scaling up redeploys the cluster template with the pool's offset set past
//! the highest index in use, so existing VMs are left alone.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Node;
use tracing::{error, info, warn};

use crate::apimodel::ApiModel;
use crate::azure::client::ResourceClient;
use crate::azure::naming::VmName;
use crate::azure::scaledown::scale_down_vms;
use crate::azure::types::VirtualMachine;
use crate::error::AkupError;
use crate::k8s::client::KubernetesConnector;
use crate::k8s::drain::safely_drain_node;
use crate::upgrade::template::{DeploymentTemplate, deployment_name};
use crate::upgrade::topology::belongs_to_cluster;

/// Label the cluster puts on every node of an agent pool.
const AGENT_POOL_LABEL: &str = "agentpool";

/// Result of a scale run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleOutcome {
    pub pool: String,
    pub previous_count: usize,
    pub new_count: usize,
}

impl ScaleOutcome {
    pub fn changed(&self) -> bool {
        self.previous_count != self.new_count
    }
}

pub struct ScaleCluster {
    resource_client: Arc<dyn ResourceClient>,
    connector: Arc<dyn KubernetesConnector>,
    subscription_id: String,
    resource_group: String,
    api_server_url: String,
    kubeconfig: String,
    drain_timeout: Duration,
}

impl ScaleCluster {
    pub fn new(
        resource_client: Arc<dyn ResourceClient>,
        connector: Arc<dyn KubernetesConnector>,
        subscription_id: &str,
        resource_group: &str,
        api_server_url: &str,
        kubeconfig: &str,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            resource_client,
            connector,
            subscription_id: subscription_id.to_string(),
            resource_group: resource_group.to_string(),
            api_server_url: api_server_url.to_string(),
            kubeconfig: kubeconfig.to_string(),
            drain_timeout,
        }
    }

    /// Bring `pool` to `desired` VMs and record the new count in `model`.
    pub async fn scale(
        &self,
        model: &mut ApiModel,
        template: &DeploymentTemplate,
        pool: &str,
        desired: usize,
    ) -> Result<ScaleOutcome> {
        if !model.agent_pools().iter().any(|p| p.name == pool) {
            return Err(AkupError::InvalidConfig(format!(
                "node pool {} not found in api model",
                pool
            ))
            .into());
        }

        let name_suffix = template.name_suffix()?;
        let vms = self.pool_vms(pool, &name_suffix).await?;
        let current = vms.len();
        let Some((highest_index, _)) = vms.last() else {
            return Err(anyhow!(
                "no VMs of node pool {} found in resource group {}",
                pool,
                self.resource_group
            ));
        };
        let next_index = highest_index + 1;

        let outcome = ScaleOutcome {
            pool: pool.to_string(),
            previous_count: current,
            new_count: desired,
        };
        if current == desired {
            info!(pool = pool, count = current, "Node pool is already at the desired count");
            return Ok(outcome);
        }

        if desired < current {
            let doomed: Vec<String> = vms[desired..]
                .iter()
                .rev()
                .map(|(_, vm)| vm.name.clone())
                .collect();
            self.scale_down(pool, &doomed).await?;
        } else {
            if next_index > current {
                warn!(pool = pool, "Node pool has unused indexes below {}, they are not refilled", next_index);
            }
            // The template creates indexes offset..count, so gaps widen the count.
            let count = (desired + next_index).saturating_sub(current);
            self.scale_up(template, pool, next_index, count).await?;
        }

        model.set_pool_count(pool, desired)?;
        Ok(outcome)
    }

    /// Nodes of `pool` as the cluster reports them.
    pub async fn pool_nodes(&self, pool: &str) -> Result<Vec<Node>> {
        let client = self
            .connector
            .connect(&self.api_server_url, &self.kubeconfig)
            .await?;
        client
            .list_nodes(Some(&format!("{}={}", AGENT_POOL_LABEL, pool)))
            .await
            .with_context(|| format!("Failed to list nodes of pool {}", pool))
    }

    /// VMs of `pool` in this cluster keyed by index, in ascending index order.
    async fn pool_vms(&self, pool: &str, name_suffix: &str) -> Result<Vec<(usize, VirtualMachine)>> {
        let vms = self
            .resource_client
            .list_virtual_machines(&self.resource_group)
            .await
            .context("Error while querying ARM for resources")?;

        let mut matched: Vec<(usize, VirtualMachine)> = vms
            .into_iter()
            .filter_map(|vm| {
                let name = VmName::parse(&vm.name).ok()?;
                if !belongs_to_cluster(&name, &vm, name_suffix) {
                    return None;
                }
                let vm_pool = vm.pool_name().unwrap_or(&name.pool);
                (vm_pool == pool).then_some((name.index, vm))
            })
            .collect();
        matched.sort_by_key(|(index, _)| *index);
        Ok(matched)
    }

    async fn scale_down(&self, pool: &str, vm_names: &[String]) -> Result<()> {
        for name in vm_names {
            info!(pool = pool, vm = %name, "Node will be cordoned and drained");
        }
        self.drain_nodes(vm_names)
            .await
            .context("Got error while draining the nodes to be deleted")?;

        scale_down_vms(
            self.resource_client.clone(),
            &self.subscription_id,
            &self.resource_group,
            vm_names,
        )
        .await
        .map_err(anyhow::Error::new)
        .with_context(|| format!("Failed to scale down node pool {}", pool))
    }

    /// Drain every node concurrently; the first failure is returned once all finished.
    async fn drain_nodes(&self, vm_names: &[String]) -> Result<()> {
        let drains = vm_names.iter().map(|vm_name| async move {
            let node_name = vm_name.to_lowercase();
            let result = safely_drain_node(
                self.connector.as_ref(),
                &self.api_server_url,
                &self.kubeconfig,
                &node_name,
                self.drain_timeout,
            )
            .await;
            (node_name, result)
        });

        let mut first_error = None;
        for (node_name, result) in join_all(drains).await {
            if let Err(e) = result {
                error!(node = %node_name, "Failed to drain node: {:#}", e);
                if first_error.is_none() {
                    first_error = Some(e.context(format!("Node {} failed to drain", node_name)));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn scale_up(
        &self,
        template: &DeploymentTemplate,
        pool: &str,
        offset: usize,
        count: usize,
    ) -> Result<()> {
        let scoped = template.scoped_to_range(pool, offset, count);
        let deployment = deployment_name(&self.resource_group);

        info!(pool = pool, offset = offset, count = count, deployment = %deployment, "Deploying new VMs");
        self.resource_client
            .deploy_template(
                &self.resource_group,
                &deployment,
                &scoped.template,
                &scoped.parameters,
            )
            .await
            .with_context(|| format!("Failed to scale up node pool {}", pool))
    }
}
