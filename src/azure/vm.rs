//! Removal of a single cluster VM and the resources it owns.

use anyhow::{Context, Result};
use tracing::info;

use super::client::ResourceClient;

/// Delete a VM, then its network interfaces, then its managed OS disk.
///
/// ARM rejects deleting a NIC that is still attached, so the VM goes first.
/// The VM is read up front so the NIC and disk names survive its deletion.
pub async fn clean_delete_virtual_machine(
    client: &dyn ResourceClient,
    resource_group: &str,
    vm_name: &str,
) -> Result<()> {
    let vm = client
        .get_virtual_machine(resource_group, vm_name)
        .await
        .with_context(|| format!("Failed to get VM {}", vm_name))?;

    info!(vm = vm_name, "Deleting VM");
    client
        .delete_virtual_machine(resource_group, vm_name)
        .await
        .with_context(|| format!("Failed to delete VM {}", vm_name))?;

    for nic in vm.network_interface_names() {
        info!(vm = vm_name, nic = %nic, "Deleting network interface");
        client
            .delete_network_interface(resource_group, &nic)
            .await
            .with_context(|| format!("Failed to delete network interface {} of VM {}", nic, vm_name))?;
    }

    if let Some(disk) = vm.managed_os_disk_name() {
        info!(vm = vm_name, disk = %disk, "Deleting OS disk");
        client
            .delete_managed_disk(resource_group, &disk)
            .await
            .with_context(|| format!("Failed to delete OS disk {} of VM {}", disk, vm_name))?;
    }

    Ok(())
}
