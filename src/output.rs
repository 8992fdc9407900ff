//! Output formatting module.

pub mod table;

pub use table::{print_node_table, print_upgrade_plan};

use colored::Colorize;

/// Print an execution phase header.
pub fn print_phase_header(phase: u8, title: &str, skipped: bool) {
    let status = if skipped { " [SKIPPED]" } else { "" };
    println!();
    println!(
        "{}",
        format!("=== Phase {}: {}{} ===", phase, title, status)
            .cyan()
            .bold()
    );
}

/// Print the header of one agent pool inside the agent pool phase.
pub fn print_pool_header(pool: &str, vm_count: usize) {
    println!();
    println!("{} ({} VM(s))", format!("Agent pool {}", pool).bold(), vm_count);
}

/// Print a step line inside a phase.
pub fn print_step(step: usize, total: usize, message: &str) {
    println!();
    println!(
        "{}",
        format!("[Step {}/{}] {}", step, total, message).bold()
    );
}

/// Print the closing summary of an upgrade run.
pub fn print_summary(target_version: &str, upgraded: usize, control_plane_only: bool) {
    println!();
    println!("{}", "=== Upgrade Complete ===".green().bold());
    println!("  Kubernetes version: {}", target_version);
    println!("  VMs replaced: {}", upgraded);
    if control_plane_only {
        println!("  Node pools: {}", "skipped (control plane only)".dimmed());
    }
    println!();
}
