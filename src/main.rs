//! akup - Kubernetes cluster upgrade and scale CLI for Azure Stack.
//!
//! Works on availability-set clusters described by an `apimodel.json`:
//! - Rolling control plane and agent pool upgrades, one VM at a time
//! - Cluster-autoscaler pause and resume around agent pool upgrades
//! - Agent pool scale up and drain-first scale down

mod apimodel;
mod azure;
mod config;
mod error;
mod k8s;
mod output;
mod retry;
mod scale;
mod upgrade;

#[cfg(test)]
mod testing;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use dialoguer::Input;
use tracing::{debug, error, info, warn};

use apimodel::ApiModel;
use azure::arm::ArmClient;
use config::{Args, Config, LogFormat, Operation, ScaleOptions, UpgradeOptions};
use error::AkupError;
use k8s::client::{KubeConnector, KubernetesConnector};
use scale::ScaleCluster;
use upgrade::cluster::UpgradeCluster;
use upgrade::template::DeploymentTemplate;
use upgrade::versions::SupportedVersions;
use upgrade::workflow::UpgradeSettings;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    if let Err(e) = init_tracing(&config.log_level, config.log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    debug!("Starting akup");

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing subscriber.
fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {}", e))?;

    let registry = tracing_subscriber::registry().with(filter);
    let initialized = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true).with_target(false))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().compact().with_target(false))
            .try_init(),
    };
    initialized.map_err(|e| anyhow::anyhow!("Failed to install subscriber: {}", e))
}

/// Main application logic.
async fn run(config: Config) -> Result<()> {
    let Config {
        subscription_id,
        resource_group,
        resource_manager_endpoint,
        access_token,
        api_model,
        kubeconfig,
        api_server,
        yes,
        operation,
        ..
    } = config;

    let model = ApiModel::load(&api_model)?;
    let kubeconfig = read_kubeconfig(&kubeconfig);
    let api_server = api_server.unwrap_or_default();

    let arm = Arc::new(ArmClient::new(
        resource_manager_endpoint,
        subscription_id.as_str(),
        access_token,
    )?);
    let connector: Arc<dyn KubernetesConnector> = Arc::new(KubeConnector);

    match operation {
        Operation::Upgrade(options) => {
            let mut settings = UpgradeSettings::new(&options.upgrade_version, &resource_group);
            settings.force = options.force;
            settings.control_plane_only = options.control_plane_only;
            settings.node_ready_timeout = options.vm_timeout;
            settings.cordon_drain_timeout = options.cordon_drain_timeout;

            let upgrader = UpgradeCluster::new(
                arm,
                connector,
                settings,
                SupportedVersions::default(),
                &api_server,
                &kubeconfig,
            );
            println!(
                "Cluster: {} (current: {}, target: {})",
                resource_group.bold(),
                model.orchestrator_version(),
                options.upgrade_version
            );
            run_upgrade(&options, model, &upgrader, &api_model, yes).await
        }
        Operation::Scale(options) => {
            let scaler = ScaleCluster::new(
                arm,
                connector,
                &subscription_id,
                &resource_group,
                &api_server,
                &kubeconfig,
                options.cordon_drain_timeout,
            );
            run_scale(&options, model, &scaler, &api_model).await
        }
    }
}

async fn run_upgrade(
    options: &UpgradeOptions,
    mut model: ApiModel,
    upgrader: &UpgradeCluster,
    api_model: &Path,
    yes: bool,
) -> Result<()> {
    let template = DeploymentTemplate::load(&options.template.template, &options.template.parameters)?;

    let name_suffix = template.name_suffix()?;
    let mut topology = upgrader.discover(&model, &name_suffix).await?;
    let pending = topology.pending_count(options.control_plane_only);
    output::print_upgrade_plan(&topology, &options.upgrade_version, options.control_plane_only);

    if options.force {
        println!("{}", "--force set: every VM is replaced and version checks are skipped.".yellow());
    }
    confirm_upgrade(yes)?;

    upgrader.upgrade(&model, &mut topology, template).await?;

    if options.control_plane_only {
        info!("Control plane only upgrade, api model version left unchanged");
    } else {
        model.set_orchestrator_version(&options.upgrade_version);
        model.save(api_model)?;
        info!(path = %api_model.display(), "Saved api model");
    }

    output::print_summary(&options.upgrade_version, pending, options.control_plane_only);
    Ok(())
}

async fn run_scale(
    options: &ScaleOptions,
    mut model: ApiModel,
    scaler: &ScaleCluster,
    api_model: &Path,
) -> Result<()> {
    let template = DeploymentTemplate::load(&options.template.template, &options.template.parameters)?;

    let outcome = scaler
        .scale(&mut model, &template, &options.node_pool, options.new_node_count)
        .await?;

    if outcome.changed() {
        model.save(api_model)?;
        println!(
            "{} Node pool {} scaled from {} to {}",
            "✓".green(),
            outcome.pool.bold(),
            outcome.previous_count,
            outcome.new_count
        );
    } else {
        println!(
            "Node pool {} is already at the desired count {}",
            outcome.pool.bold(),
            outcome.new_count
        );
    }

    match scaler.pool_nodes(&options.node_pool).await {
        Ok(nodes) => {
            println!();
            println!("Nodes in pool {}:", options.node_pool);
            output::print_node_table(&nodes);
        }
        Err(e) => warn!("Unable to get nodes in pool {} after scaling: {:#}", options.node_pool, e),
    }
    Ok(())
}

/// Ask the operator to type Yes unless `--yes` was given.
fn confirm_upgrade(yes: bool) -> Result<()> {
    if yes {
        return Ok(());
    }

    println!(
        "{}",
        "This will delete and recreate the VMs listed above. This action cannot be undone."
            .yellow()
            .bold()
    );

    let confirmation: String = Input::new()
        .with_prompt(format!("Type {} to confirm", "Yes".green().bold()))
        .interact_text()?;

    if confirmation != "Yes" {
        println!(
            "{}",
            "Upgrade cancelled. You must type 'Yes' to proceed.".red()
        );
        return Err(AkupError::UserCancelled.into());
    }
    Ok(())
}

/// Kubeconfig contents, or an empty string that fails to connect later.
fn read_kubeconfig(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(path = %path.display(), "Failed to read kubeconfig: {}", e);
            String::new()
        }
    }
}
