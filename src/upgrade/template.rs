//! ARM deployment template and parameter handling.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::error::AkupError;

/// ARM limits deployment names to 64 characters.
const MAX_DEPLOYMENT_NAME_LEN: usize = 64;

/// A cluster deployment template with its parameter values.
#[derive(Debug, Clone)]
pub struct DeploymentTemplate {
    pub template: Value,
    pub parameters: Value,
}

impl DeploymentTemplate {
    /// Load `azuredeploy.json` and `azuredeploy.parameters.json` style files.
    ///
    /// A parameters file wrapped in the ARM parameter file schema
    /// (`{"parameters": {...}}`) is unwrapped.
    pub fn load(template_path: &Path, parameters_path: &Path) -> Result<Self> {
        let template = read_json(template_path)?;
        let mut parameters = read_json(parameters_path)?;
        if parameters.get("$schema").is_some() {
            parameters = parameters
                .get("parameters")
                .cloned()
                .unwrap_or_else(|| json!({}));
        }
        if !parameters.is_object() {
            return Err(AkupError::InvalidConfig(format!(
                "{} does not contain a parameters object",
                parameters_path.display()
            ))
            .into());
        }
        Ok(Self {
            template,
            parameters,
        })
    }

    /// Copy of the template that deploys exactly the VM at `index` of `pool`.
    ///
    /// The template's copy loops create `<pool>Count - <pool>Offset` VMs
    /// starting at index `<pool>Offset`.
    pub fn scoped_to_index(&self, pool: &str, index: usize) -> Self {
        self.scoped_to_range(pool, index, index + 1)
    }

    /// Copy of the template with `<pool>Offset = offset` and `<pool>Count = count`.
    pub fn scoped_to_range(&self, pool: &str, offset: usize, count: usize) -> Self {
        let mut scoped = self.clone();
        scoped.set_parameter(&format!("{}Offset", pool), json!(offset));
        scoped.set_parameter(&format!("{}Count", pool), json!(count));
        scoped
    }

    /// The cluster suffix from the `nameSuffix` parameter, e.g. `12345678`.
    pub fn name_suffix(&self) -> Result<String> {
        self.parameters
            .get("nameSuffix")
            .and_then(|p| p.get("value"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                AkupError::InvalidConfig(
                    "deployment parameters do not define nameSuffix".to_string(),
                )
                .into()
            })
    }

    pub fn set_parameter(&mut self, key: &str, value: Value) {
        if let Some(map) = self.parameters.as_object_mut() {
            add_value(map, key, value);
        }
    }
}

/// Set an ARM parameter using the `{"value": v}` shape.
pub fn add_value(parameters: &mut Map<String, Value>, key: &str, value: Value) {
    parameters.insert(key.to_string(), json!({ "value": value }));
}

/// Unique deployment name built from `prefix` and the current time.
pub fn deployment_name(prefix: &str) -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    let budget = MAX_DEPLOYMENT_NAME_LEN - stamp.len() - 1;
    let prefix: String = prefix.chars().take(budget).collect();
    format!("{}-{}", prefix, stamp)
}

fn read_json(path: &Path) -> Result<Value> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}
