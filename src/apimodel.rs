//! Cluster definition (`apimodel.json`).
//!
//! Only the fields the orchestrator reads or writes are typed. Everything
//! else is kept in `extra` maps so a rewrite preserves the whole document.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AkupError;

pub const CLUSTER_AUTOSCALER_ADDON: &str = "cluster-autoscaler";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiModel {
    pub properties: Properties,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    pub orchestrator_profile: OrchestratorProfile,
    pub master_profile: MasterProfile,
    #[serde(default)]
    pub agent_pool_profiles: Vec<AgentPoolProfile>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorProfile {
    pub orchestrator_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_config: Option<KubernetesConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addons: Vec<Addon>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Addon {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterProfile {
    pub count: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPoolProfile {
    pub name: String,
    pub count: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ApiModel {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read api model {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse api model {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize api model")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write api model {}", path.display()))
    }

    pub fn orchestrator_version(&self) -> &str {
        &self.properties.orchestrator_profile.orchestrator_version
    }

    pub fn set_orchestrator_version(&mut self, version: &str) {
        self.properties.orchestrator_profile.orchestrator_version = version.to_string();
    }

    pub fn master_count(&self) -> usize {
        self.properties.master_profile.count
    }

    pub fn agent_pools(&self) -> &[AgentPoolProfile] {
        &self.properties.agent_pool_profiles
    }

    pub fn set_pool_count(&mut self, pool: &str, count: usize) -> Result<()> {
        let profile = self
            .properties
            .agent_pool_profiles
            .iter_mut()
            .find(|p| p.name == pool)
            .ok_or_else(|| AkupError::InvalidConfig(format!("node pool {} not found in api model", pool)))?;
        profile.count = count;
        Ok(())
    }

    pub fn is_addon_enabled(&self, name: &str) -> bool {
        self.properties
            .orchestrator_profile
            .kubernetes_config
            .as_ref()
            .and_then(|k| k.addons.iter().find(|a| a.name == name))
            .is_some_and(|a| a.enabled == Some(true))
    }
}
