//! Cloud resource client abstraction.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::types::VirtualMachine;

/// The subset of ARM operations the orchestrator consumes.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list_virtual_machines(&self, resource_group: &str) -> Result<Vec<VirtualMachine>>;

    async fn get_virtual_machine(&self, resource_group: &str, name: &str)
    -> Result<VirtualMachine>;

    /// Delete a VM and wait for the operation to finish. Deleting a VM that
    /// does not exist succeeds.
    async fn delete_virtual_machine(&self, resource_group: &str, name: &str) -> Result<()>;

    async fn delete_network_interface(&self, resource_group: &str, name: &str) -> Result<()>;

    async fn delete_managed_disk(&self, resource_group: &str, name: &str) -> Result<()>;

    /// Submit an incremental deployment and wait until it reaches a terminal state.
    async fn deploy_template(
        &self,
        resource_group: &str,
        deployment_name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<()>;
}
