//! Batch VM deletion with per-VM error collection.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::client::ResourceClient;
use super::vm::clean_delete_virtual_machine;

/// A VM that failed to delete, with the reason.
#[derive(Debug)]
pub struct VmScalingErrorDetails {
    pub name: String,
    pub error: anyhow::Error,
}

/// Every failure from one scale-down batch, in the order results arrived.
#[derive(Debug, Default)]
pub struct ScaleDownErrors(pub Vec<VmScalingErrorDetails>);

impl fmt::Display for ScaleDownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .0
            .iter()
            .map(|d| format!("Node '{}' failed to delete with error: '{:#}'", d.name, d.error))
            .collect();
        write!(f, "{}", lines.join("\n"))
    }
}

impl std::error::Error for ScaleDownErrors {}

/// Delete every named VM concurrently.
///
/// One task per VM reports over a channel sized to the batch, and exactly
/// `vm_names.len()` results are collected. A failure never stops the other
/// deletions.
pub async fn scale_down_vms(
    client: Arc<dyn ResourceClient>,
    subscription_id: &str,
    resource_group: &str,
    vm_names: &[String],
) -> Result<(), ScaleDownErrors> {
    info!(
        subscription = subscription_id,
        resource_group = resource_group,
        count = vm_names.len(),
        "Scaling down VMs"
    );

    let (tx, mut rx) = mpsc::channel(vm_names.len().max(1));

    for (slot, name) in vm_names.iter().enumerate() {
        let tx = tx.clone();
        let client = client.clone();
        let resource_group = resource_group.to_string();
        let name = name.clone();

        tokio::spawn(async move {
            let result = clean_delete_virtual_machine(client.as_ref(), &resource_group, &name).await;
            // The receiver outlives every sender.
            let _ = tx.send((slot, result)).await;
        });
    }
    drop(tx);

    let mut reported = vec![false; vm_names.len()];
    let mut errors = ScaleDownErrors::default();

    for _ in 0..vm_names.len() {
        let Some((slot, result)) = rx.recv().await else {
            break;
        };
        reported[slot] = true;
        if let Err(error) = result {
            warn!(vm = %vm_names[slot], error = %format!("{:#}", error), "Failed to delete VM");
            errors.0.push(VmScalingErrorDetails {
                name: vm_names[slot].clone(),
                error,
            });
        }
    }

    // A task that panicked never reported; count it as a failure.
    for (slot, done) in reported.iter().enumerate() {
        if !done {
            errors.0.push(VmScalingErrorDetails {
                name: vm_names[slot].clone(),
                error: anyhow::anyhow!("deletion task exited without reporting"),
            });
        }
    }

    if errors.0.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
