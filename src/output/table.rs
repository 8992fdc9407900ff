//! Table formatting for CLI output.

use colored::Colorize;
use k8s_openapi::api::core::v1::Node;
use tabled::settings::object::Columns;
use tabled::settings::themes::Theme;
use tabled::settings::{Modify, Padding, Style};
use tabled::{Table, Tabled};

use crate::azure::naming::MASTER_POOL;
use crate::azure::types::VirtualMachine;
use crate::k8s::node::is_node_ready;
use crate::upgrade::topology::ClusterTopology;

#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "POOL")]
    pool: String,
    #[tabled(rename = "VM")]
    vm: String,
    #[tabled(rename = "VERSION")]
    version: String,
    #[tabled(rename = "ACTION")]
    action: String,
}

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "VERSION")]
    version: String,
}

/// Print every VM of the cluster with the action the upgrade will take on it.
pub fn print_upgrade_plan(topology: &ClusterTopology, target_version: &str, control_plane_only: bool) {
    let rows = plan_rows(topology, control_plane_only);
    let pending = topology.pending_count(control_plane_only);

    println!(
        "{}",
        format!("Upgrade Plan: {} VM(s) to Kubernetes {}", pending, target_version).bold()
    );
    println!("{}", "=".repeat(60));

    if rows.is_empty() {
        println!("  No VMs found");
        return;
    }

    let mut table = Table::new(&rows);
    apply_table_style(&mut table);
    println!("{}", table);
}

/// Print nodes with their readiness and kubelet version.
pub fn print_node_table(nodes: &[Node]) {
    if nodes.is_empty() {
        println!("No nodes found.");
        return;
    }

    let mut table = Table::new(node_rows(nodes));
    apply_table_style(&mut table);
    println!("{}", table);
}

fn plan_rows(topology: &ClusterTopology, control_plane_only: bool) -> Vec<PlanRow> {
    let mut rows = Vec::new();
    push_rows(&mut rows, MASTER_POOL, &topology.master_vms, "upgrade");
    push_rows(&mut rows, MASTER_POOL, &topology.upgraded_master_vms, "skip");

    for name in topology.sorted_pool_names() {
        let Some(pool) = topology.agent_pools.get(&name) else {
            continue;
        };
        let action = if control_plane_only { "skip" } else { "upgrade" };
        push_rows(&mut rows, &name, &pool.agent_vms, action);
        push_rows(&mut rows, &name, &pool.upgraded_agent_vms, "skip");
    }
    rows
}

fn push_rows(rows: &mut Vec<PlanRow>, pool: &str, vms: &[VirtualMachine], action: &str) {
    rows.extend(vms.iter().map(|vm| PlanRow {
        pool: pool.to_string(),
        vm: vm.name.clone(),
        version: vm.orchestrator_version().unwrap_or("-").to_string(),
        action: action.to_string(),
    }));
}

fn node_rows(nodes: &[Node]) -> Vec<NodeRow> {
    nodes
        .iter()
        .map(|node| NodeRow {
            name: node.metadata.name.clone().unwrap_or_default(),
            status: if is_node_ready(node) { "Ready" } else { "NotReady" }.to_string(),
            version: node
                .status
                .as_ref()
                .and_then(|s| s.node_info.as_ref())
                .map(|info| info.kubelet_version.clone())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect()
}

fn apply_table_style(table: &mut Table) {
    let mut theme = Theme::from_style(Style::empty());
    theme.remove_horizontal_lines();
    table.with(theme);
    table.with(Modify::new(Columns::new(..)).with(Padding::new(0, 2, 0, 0)));
}
