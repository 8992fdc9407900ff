//! ARM virtual machine representation.
//!
//! Only the fields the orchestrator reads are modeled. Everything else in
//! the ARM payload is ignored on deserialization.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Tag carrying `"Kubernetes:<version>"` on every cluster VM.
pub const ORCHESTRATOR_TAG: &str = "orchestrator";
/// Tag carrying the agent pool name on agent VMs.
pub const POOL_NAME_TAG: &str = "poolName";
/// Tag carrying the cluster name suffix.
pub const NAME_SUFFIX_TAG: &str = "resourceNameSuffix";

const ORCHESTRATOR_PREFIX: &str = "Kubernetes:";

/// A compute instance as returned by ARM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub properties: VirtualMachineProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineProperties {
    #[serde(default)]
    pub provisioning_state: Option<String>,
    #[serde(default)]
    pub storage_profile: Option<StorageProfile>,
    #[serde(default)]
    pub network_profile: Option<NetworkProfile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProfile {
    #[serde(default)]
    pub os_disk: Option<OsDisk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsDisk {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub managed_disk: Option<ManagedDisk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedDisk {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceReference {
    pub id: String,
}

/// One page of a list response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineListResult {
    #[serde(default)]
    pub value: Vec<VirtualMachine>,
    #[serde(default)]
    pub next_link: Option<String>,
}

impl VirtualMachine {
    /// Kubernetes version recorded in the orchestrator tag, if any.
    pub fn orchestrator_version(&self) -> Option<&str> {
        self.tags
            .get(ORCHESTRATOR_TAG)
            .and_then(|v| v.strip_prefix(ORCHESTRATOR_PREFIX))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn pool_name(&self) -> Option<&str> {
        self.tags.get(POOL_NAME_TAG).map(String::as_str)
    }

    pub fn name_suffix(&self) -> Option<&str> {
        self.tags.get(NAME_SUFFIX_TAG).map(String::as_str)
    }

    /// Names of the attached network interfaces, taken from their resource IDs.
    pub fn network_interface_names(&self) -> Vec<String> {
        self.properties
            .network_profile
            .as_ref()
            .map(|p| {
                p.network_interfaces
                    .iter()
                    .filter_map(|nic| resource_name(&nic.id))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Name of the managed OS disk. Unmanaged (blob) disks return `None`.
    pub fn managed_os_disk_name(&self) -> Option<String> {
        let os_disk = self.properties.storage_profile.as_ref()?.os_disk.as_ref()?;
        let managed = os_disk.managed_disk.as_ref()?;
        managed
            .id
            .as_deref()
            .and_then(resource_name)
            .or(os_disk.name.as_deref())
            .map(str::to_string)
    }

    /// Kubernetes node name registered by this VM.
    pub fn node_name(&self) -> String {
        self.name.to_lowercase()
    }
}

/// Last path segment of an ARM resource ID.
pub fn resource_name(id: &str) -> Option<&str> {
    id.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
}
