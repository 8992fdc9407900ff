//! Discovered cluster VMs, split into pending and upgraded sets.

use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, warn};

use super::versions::{SupportedVersions, same_version};
use crate::apimodel::ApiModel;
use crate::azure::naming::VmName;
use crate::azure::types::VirtualMachine;
use crate::error::AkupError;

/// VMs of one agent pool.
#[derive(Debug, Clone, Default)]
pub struct AgentPoolTopology {
    pub name: String,
    /// Desired number of VMs in the pool.
    pub count: usize,
    pub agent_vms: Vec<VirtualMachine>,
    pub upgraded_agent_vms: Vec<VirtualMachine>,
}

/// Every cluster VM, each in exactly one of the pending or upgraded lists.
#[derive(Debug, Clone, Default)]
pub struct ClusterTopology {
    /// Cluster suffix shared by all VM names, e.g. `12345678` in `k8s-master-12345678-0`.
    pub name_suffix: String,
    pub master_count: usize,
    pub master_vms: Vec<VirtualMachine>,
    pub upgraded_master_vms: Vec<VirtualMachine>,
    pub agent_pools: HashMap<String, AgentPoolTopology>,
}

/// Rules for deciding whether a VM still needs the upgrade.
pub struct Classifier<'a> {
    pub target_version: &'a str,
    pub force: bool,
    pub versions: &'a SupportedVersions,
}

impl Classifier<'_> {
    /// Returns true if the VM must be replaced, or an error if its version cannot reach the target.
    pub fn needs_upgrade(&self, vm: &VirtualMachine) -> Result<bool> {
        if self.force {
            return Ok(true);
        }

        match vm.orchestrator_version() {
            None => {
                warn!(vm = %vm.name, "VM has no orchestrator version tag, upgrading it");
                Ok(true)
            }
            Some(version) if same_version(version, self.target_version) => Ok(false),
            Some(version) => {
                self.versions
                    .check_upgrade_path(version, self.target_version, false)?;
                Ok(true)
            }
        }
    }
}

impl ClusterTopology {
    /// Empty topology with the pools and counts declared in the api model.
    ///
    /// `name_suffix` is the cluster's `nameSuffix` deployment parameter.
    pub fn from_model(model: &ApiModel, name_suffix: &str) -> Self {
        let agent_pools = model
            .agent_pools()
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    AgentPoolTopology {
                        name: p.name.clone(),
                        count: p.count,
                        ..Default::default()
                    },
                )
            })
            .collect();

        Self {
            name_suffix: name_suffix.to_string(),
            master_count: model.master_count(),
            agent_pools,
            ..Default::default()
        }
    }

    /// Sort `vms` into master and agent pool buckets.
    ///
    /// VMs that do not follow the cluster naming scheme, carry another
    /// cluster suffix, or belong to an undeclared pool are ignored.
    pub fn classify(&mut self, vms: Vec<VirtualMachine>, classifier: &Classifier<'_>) -> Result<()> {
        if self.name_suffix.is_empty() {
            return Err(AkupError::InvalidConfig("cluster name suffix is not set".to_string()).into());
        }

        let mut parsed: Vec<(VmName, VirtualMachine)> = vms
            .into_iter()
            .filter_map(|vm| match VmName::parse(&vm.name) {
                Ok(name) => Some((name, vm)),
                Err(_) => {
                    debug!(vm = %vm.name, "Skipping VM outside the cluster naming scheme");
                    None
                }
            })
            .collect();
        parsed.sort_by_key(|(name, _)| name.index);

        for (name, vm) in parsed {
            if !belongs_to_cluster(&name, &vm, &self.name_suffix) {
                debug!(vm = %vm.name, "Skipping VM from another cluster");
                continue;
            }

            let pending = classifier.needs_upgrade(&vm)?;

            if name.is_master() {
                if pending {
                    self.master_vms.push(vm);
                } else {
                    self.upgraded_master_vms.push(vm);
                }
                continue;
            }

            let pool_name = vm.pool_name().unwrap_or(&name.pool).to_string();
            let Some(pool) = self.agent_pools.get_mut(&pool_name) else {
                debug!(vm = %vm.name, pool = %pool_name, "Skipping VM of an undeclared pool");
                continue;
            };
            if pending {
                pool.agent_vms.push(vm);
            } else {
                pool.upgraded_agent_vms.push(vm);
            }
        }

        Ok(())
    }

    /// Pool names in a stable order.
    pub fn sorted_pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agent_pools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of VMs still waiting for the upgrade.
    pub fn pending_count(&self, control_plane_only: bool) -> usize {
        let agents: usize = if control_plane_only {
            0
        } else {
            self.agent_pools.values().map(|p| p.agent_vms.len()).sum()
        };
        self.master_vms.len() + agents
    }
}

/// True if both the parsed name and the suffix tag, when present, match `suffix`.
pub fn belongs_to_cluster(name: &VmName, vm: &VirtualMachine, suffix: &str) -> bool {
    name.suffix == suffix && vm.name_suffix().is_none_or(|tag| tag == suffix)
}
