//! Availability-set upgrade workflow.
//!
//! VMs are replaced one at a time: control plane first, then each agent pool
//! in name order, each in ascending index order. A replacement drains the old
//! node, deletes the VM, redeploys the template scoped to that index, waits
//! for the new node to become Ready and copies custom node metadata over.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use tracing::{info, warn};

use super::health::{check_control_plane_nodes_status, upgraded_not_ready_stream};
use super::template::{DeploymentTemplate, deployment_name};
use super::topology::ClusterTopology;
use crate::azure::client::ResourceClient;
use crate::azure::naming::{MASTER_POOL, VmName};
use crate::azure::types::VirtualMachine;
use crate::azure::vm::clean_delete_virtual_machine;
use crate::error::AkupError;
use crate::k8s::client::KubernetesClient;
use crate::k8s::drain::DrainOperation;
use crate::k8s::node::{copy_custom_properties, wait_for_node_ready};
use crate::output;
use crate::retry::RetryConfig;

/// An upgrade strategy over a discovered topology.
#[async_trait]
pub trait UpgradeWorkflow: Send + Sync {
    /// Reject a topology the workflow cannot upgrade, before anything is mutated.
    fn validate(&self, topology: &ClusterTopology) -> Result<()>;

    /// Replace every pending VM, moving each into the upgraded set once done.
    async fn run_upgrade(&self, topology: &mut ClusterTopology) -> Result<()>;
}

/// Parameters of one upgrade run.
#[derive(Debug, Clone)]
pub struct UpgradeSettings {
    pub upgrade_version: String,
    pub force: bool,
    pub control_plane_only: bool,
    pub resource_group: String,
    /// How long a replacement node may take to become Ready.
    pub node_ready_timeout: Duration,
    pub node_ready_interval: Duration,
    pub cordon_drain_timeout: Duration,
    /// Polling of upgraded control-plane nodes before each control-plane replacement.
    pub health_backoff: RetryConfig,
    pub health_timeout: Duration,
    /// Conflict retries when writing custom properties to a new node.
    pub property_retry: RetryConfig,
}

impl UpgradeSettings {
    pub fn new(upgrade_version: &str, resource_group: &str) -> Self {
        Self {
            upgrade_version: upgrade_version.to_string(),
            force: false,
            control_plane_only: false,
            resource_group: resource_group.to_string(),
            node_ready_timeout: Duration::from_secs(20 * 60),
            node_ready_interval: Duration::from_secs(10),
            cordon_drain_timeout: Duration::from_secs(20 * 60),
            health_backoff: RetryConfig {
                max_attempts: 6,
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(60),
                backoff_multiplier: 2.0,
            },
            health_timeout: Duration::from_secs(5 * 60),
            property_retry: RetryConfig::with_max_attempts(5),
        }
    }
}

/// Replaces VMs of an availability-set cluster in place.
pub struct AvailabilitySetWorkflow {
    resource_client: Arc<dyn ResourceClient>,
    kube: Option<Arc<dyn KubernetesClient>>,
    template: DeploymentTemplate,
    settings: UpgradeSettings,
}

impl AvailabilitySetWorkflow {
    pub fn new(
        resource_client: Arc<dyn ResourceClient>,
        kube: Option<Arc<dyn KubernetesClient>>,
        template: DeploymentTemplate,
        settings: UpgradeSettings,
    ) -> Self {
        Self {
            resource_client,
            kube,
            template,
            settings,
        }
    }

    async fn upgrade_control_plane(&self, topology: &mut ClusterTopology) -> Result<()> {
        let missing = missing_indexes(
            &topology.master_vms,
            &topology.upgraded_master_vms,
            topology.master_count,
        );
        let total = topology.master_vms.len() + missing.len();
        output::print_phase_header(1, "Control Plane Upgrade", total == 0);

        let mut step = 0;
        while let Some(vm) = topology.master_vms.first().cloned() {
            step += 1;
            output::print_step(step, total, &format!("Replacing {}", vm.name));

            self.check_control_plane_health(&topology.upgraded_master_vms)
                .await?;
            let name = VmName::parse(&vm.name)?;
            self.replace_vm(&vm, MASTER_POOL, name.index).await?;

            let vm = topology.master_vms.remove(0);
            topology.upgraded_master_vms.push(vm);
        }

        for index in missing {
            let vm = missing_vm(&topology.name_suffix, MASTER_POOL, index);
            step += 1;
            output::print_step(step, total, &format!("Creating missing {}", vm.name));

            self.check_control_plane_health(&topology.upgraded_master_vms)
                .await?;
            self.create_vm(MASTER_POOL, index, &vm.node_name()).await?;
            topology.upgraded_master_vms.push(vm);
        }

        Ok(())
    }

    async fn upgrade_agent_pool(&self, topology: &mut ClusterTopology, pool_name: &str) -> Result<()> {
        let suffix = topology.name_suffix.clone();
        let Some(pool) = topology.agent_pools.get_mut(pool_name) else {
            return Ok(());
        };

        let missing = missing_indexes(&pool.agent_vms, &pool.upgraded_agent_vms, pool.count);
        let total = pool.agent_vms.len() + missing.len();
        if total == 0 {
            info!(pool = pool_name, "Agent pool already at target version");
            return Ok(());
        }
        output::print_pool_header(pool_name, total);

        let mut step = 0;
        while let Some(vm) = pool.agent_vms.first().cloned() {
            step += 1;
            output::print_step(step, total, &format!("Replacing {}", vm.name));

            let name = VmName::parse(&vm.name)?;
            self.replace_vm(&vm, pool_name, name.index)
                .await
                .with_context(|| format!("Failed to upgrade agent pool {}", pool_name))?;

            let vm = pool.agent_vms.remove(0);
            pool.upgraded_agent_vms.push(vm);
        }

        for index in missing {
            let vm = missing_vm(&suffix, pool_name, index);
            step += 1;
            output::print_step(step, total, &format!("Creating missing {}", vm.name));

            self.create_vm(pool_name, index, &vm.node_name())
                .await
                .with_context(|| format!("Failed to upgrade agent pool {}", pool_name))?;
            pool.upgraded_agent_vms.push(vm);
        }

        Ok(())
    }

    /// Drain, delete and redeploy one VM, then carry its node metadata over.
    async fn replace_vm(&self, vm: &VirtualMachine, pool: &str, index: usize) -> Result<()> {
        let node_name = vm.node_name();
        info!(vm = %vm.name, node = %node_name, "Upgrading VM");

        let old_node = self.snapshot_node(&node_name).await;
        self.drain_node(&node_name).await;

        clean_delete_virtual_machine(
            self.resource_client.as_ref(),
            &self.settings.resource_group,
            &vm.name,
        )
        .await?;

        self.create_vm(pool, index, &node_name).await?;

        if let (Some(kube), Some(old_node)) = (&self.kube, old_node) {
            if let Err(e) = copy_custom_properties(
                kube.as_ref(),
                &old_node,
                &node_name,
                &self.settings.property_retry,
            )
            .await
            {
                warn!(node = %node_name, "{:#}", e);
            }
        }

        info!(vm = %vm.name, "VM upgraded");
        Ok(())
    }

    /// Deploy the VM at `index` of `pool` and wait for its node.
    async fn create_vm(&self, pool: &str, index: usize, node_name: &str) -> Result<()> {
        let scoped = self.template.scoped_to_index(pool, index);
        let deployment = deployment_name(&format!("k8s-upgrade-{}-{}", pool, index));

        info!(pool = pool, index = index, deployment = %deployment, "Deploying VM");
        self.resource_client
            .deploy_template(
                &self.settings.resource_group,
                &deployment,
                &scoped.template,
                &scoped.parameters,
            )
            .await
            .with_context(|| format!("Failed to deploy VM {} of pool {}", index, pool))?;

        let Some(kube) = &self.kube else {
            warn!(node = node_name, "No Kubernetes client, not waiting for node to become ready");
            return Ok(());
        };
        wait_for_node_ready(
            kube.as_ref(),
            node_name,
            self.settings.node_ready_interval,
            self.settings.node_ready_timeout,
        )
        .await?;
        Ok(())
    }

    async fn snapshot_node(&self, node_name: &str) -> Option<Node> {
        let kube = self.kube.as_ref()?;
        match kube.get_node(node_name).await {
            Ok(node) => Some(node),
            Err(e) => {
                warn!(node = node_name, "Failed to get node, custom properties will not be copied: {:#}", e);
                None
            }
        }
    }

    async fn drain_node(&self, node_name: &str) {
        let Some(kube) = &self.kube else {
            warn!(node = node_name, "No Kubernetes client, skipping drain");
            return;
        };
        let drain = DrainOperation::new(kube.as_ref(), node_name, self.settings.cordon_drain_timeout);
        if let Err(e) = drain.run().await {
            warn!(node = node_name, "Error draining node, continuing with upgrade: {:#}", e);
        }
    }

    async fn check_control_plane_health(&self, upgraded: &[VirtualMachine]) -> Result<()> {
        let Some(kube) = &self.kube else {
            return Ok(());
        };
        if upgraded.is_empty() {
            return Ok(());
        }

        let names = upgraded.iter().map(VirtualMachine::node_name).collect();
        let snapshots =
            upgraded_not_ready_stream(kube.clone(), names, self.settings.health_backoff.clone());
        check_control_plane_nodes_status(self.settings.health_timeout, snapshots).await
    }
}

#[async_trait]
impl UpgradeWorkflow for AvailabilitySetWorkflow {
    fn validate(&self, topology: &ClusterTopology) -> Result<()> {
        validate_indexes(
            MASTER_POOL,
            topology.master_vms.iter().chain(&topology.upgraded_master_vms),
        )?;
        for pool in topology.agent_pools.values() {
            validate_indexes(
                &pool.name,
                pool.agent_vms.iter().chain(&pool.upgraded_agent_vms),
            )?;
        }
        Ok(())
    }

    async fn run_upgrade(&self, topology: &mut ClusterTopology) -> Result<()> {
        self.upgrade_control_plane(topology).await?;

        let pools = topology.sorted_pool_names();
        output::print_phase_header(2, "Agent Pool Upgrade", self.settings.control_plane_only);
        if self.settings.control_plane_only {
            info!("Control plane only, skipping agent pools");
            return Ok(());
        }

        for pool in pools {
            self.upgrade_agent_pool(topology, &pool).await?;
        }
        Ok(())
    }
}

/// Every VM name must parse and no two VMs of a pool may share an index.
fn validate_indexes<'a>(pool: &str, vms: impl Iterator<Item = &'a VirtualMachine>) -> Result<()> {
    let mut seen = HashSet::new();
    for vm in vms {
        let name = VmName::parse(&vm.name)?;
        if !seen.insert(name.index) {
            return Err(AkupError::InvalidConfig(format!(
                "pool {} has more than one VM with index {}",
                pool, name.index
            ))
            .into());
        }
    }
    Ok(())
}

/// Indexes below `count` that no VM occupies.
fn missing_indexes(pending: &[VirtualMachine], upgraded: &[VirtualMachine], count: usize) -> Vec<usize> {
    let present: HashSet<usize> = pending
        .iter()
        .chain(upgraded)
        .filter_map(|vm| VmName::parse(&vm.name).ok())
        .map(|name| name.index)
        .collect();
    (0..count).filter(|i| !present.contains(i)).collect()
}

fn missing_vm(suffix: &str, pool: &str, index: usize) -> VirtualMachine {
    let name = VmName {
        pool: pool.to_string(),
        suffix: suffix.to_string(),
        index,
    };
    VirtualMachine {
        name: name.to_string(),
        ..Default::default()
    }
}
