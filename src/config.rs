//! CLI configuration and argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;

use crate::azure::arm::DEFAULT_RESOURCE_MANAGER_ENDPOINT;
use crate::error::AkupError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Kubernetes cluster upgrade and scale CLI for Azure Stack availability-set clusters.
///
/// Replaces control plane and agent pool VMs one at a time with VMs running
/// a new Kubernetes version, and grows or shrinks agent pools.
#[derive(Parser, Debug, Clone)]
#[command(name = "akup")]
#[command(about = "Kubernetes cluster upgrade and scale CLI for Azure Stack")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Azure subscription ID
    #[arg(long, global = true, env = "AZURE_SUBSCRIPTION_ID", default_value = "")]
    pub subscription_id: String,

    /// Resource group containing the cluster VMs
    #[arg(short = 'g', long, global = true, env = "AZURE_RESOURCE_GROUP", default_value = "")]
    pub resource_group: String,

    /// Azure Resource Manager endpoint
    #[arg(long, global = true, env = "AZURE_RESOURCE_MANAGER_ENDPOINT", default_value = DEFAULT_RESOURCE_MANAGER_ENDPOINT)]
    pub resource_manager_endpoint: String,

    /// Bearer token for the Resource Manager endpoint
    #[arg(long, global = true, env = "AZURE_ACCESS_TOKEN", hide_env_values = true, default_value = "")]
    pub access_token: String,

    /// Path to the cluster definition (apimodel.json)
    #[arg(short = 'm', long, global = true, default_value = "_output/apimodel.json")]
    pub api_model: PathBuf,

    /// Path to the cluster admin kubeconfig
    #[arg(long, global = true, env = "KUBECONFIG", default_value = "_output/kubeconfig.json")]
    pub kubeconfig: PathBuf,

    /// Override the API server URL found in the kubeconfig
    #[arg(long, global = true)]
    pub apiserver: Option<String>,

    /// Skip confirmation prompts
    #[arg(short, long, global = true, default_value = "false")]
    pub yes: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "AKUP_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "pretty", env = "AKUP_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Upgrade the cluster to a new Kubernetes version
    #[command(after_help = r#"Examples:
  akup upgrade -g my-rg --upgrade-version 1.18.10
  akup upgrade -g my-rg --upgrade-version 1.18.10 --control-plane-only"#)]
    Upgrade {
        /// Kubernetes version to upgrade to
        #[arg(long)]
        upgrade_version: String,

        /// Replace every VM and skip version path checks
        #[arg(long, default_value = "false")]
        force: bool,

        /// Upgrade control plane VMs only
        #[arg(long, default_value = "false")]
        control_plane_only: bool,

        /// Minutes to wait for a replaced VM to become a Ready node
        #[arg(long, default_value = "20")]
        vm_timeout: u64,

        /// Minutes allowed to cordon and drain a node
        #[arg(long, default_value = "20")]
        cordon_drain_timeout: u64,

        #[command(flatten)]
        template: TemplateArgs,
    },

    /// Scale an agent pool to a new node count
    Scale {
        /// Agent pool to scale
        #[arg(long)]
        node_pool: String,

        /// Desired number of nodes
        #[arg(short = 'c', long)]
        new_node_count: usize,

        /// Minutes allowed to cordon and drain a node
        #[arg(long, default_value = "20")]
        cordon_drain_timeout: u64,

        #[command(flatten)]
        template: TemplateArgs,
    },
}

/// Deployment template files generated for the cluster.
#[derive(clap::Args, Debug, Clone)]
pub struct TemplateArgs {
    /// Path to azuredeploy.json
    #[arg(long, default_value = "_output/azuredeploy.json")]
    pub template: PathBuf,

    /// Path to azuredeploy.parameters.json
    #[arg(long, default_value = "_output/azuredeploy.parameters.json")]
    pub parameters: PathBuf,
}

/// Resolved `upgrade` options.
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    pub upgrade_version: String,
    pub force: bool,
    pub control_plane_only: bool,
    pub vm_timeout: Duration,
    pub cordon_drain_timeout: Duration,
    pub template: TemplateArgs,
}

/// Resolved `scale` options.
#[derive(Debug, Clone)]
pub struct ScaleOptions {
    pub node_pool: String,
    pub new_node_count: usize,
    pub cordon_drain_timeout: Duration,
    pub template: TemplateArgs,
}

#[derive(Debug, Clone)]
pub enum Operation {
    Upgrade(UpgradeOptions),
    Scale(ScaleOptions),
}

/// Application configuration derived from CLI args.
#[derive(Debug)]
pub struct Config {
    pub subscription_id: String,
    pub resource_group: String,
    pub resource_manager_endpoint: String,
    pub access_token: SecretString,
    pub api_model: PathBuf,
    pub kubeconfig: PathBuf,
    pub api_server: Option<String>,
    pub yes: bool,
    pub log_level: String,
    pub log_format: LogFormat,
    pub operation: Operation,
}

impl Config {
    /// Create config from CLI arguments, rejecting values no operation can run with.
    pub fn from_args(args: Args) -> Result<Self, AkupError> {
        require("--subscription-id", &args.subscription_id)?;
        require("--resource-group", &args.resource_group)?;
        require("--access-token", &args.access_token)?;

        let operation = match args.command {
            Command::Upgrade {
                upgrade_version,
                force,
                control_plane_only,
                vm_timeout,
                cordon_drain_timeout,
                template,
            } => {
                require("--upgrade-version", &upgrade_version)?;
                Operation::Upgrade(UpgradeOptions {
                    upgrade_version: upgrade_version.trim().trim_start_matches('v').to_string(),
                    force,
                    control_plane_only,
                    vm_timeout: minutes("--vm-timeout", vm_timeout)?,
                    cordon_drain_timeout: minutes("--cordon-drain-timeout", cordon_drain_timeout)?,
                    template,
                })
            }
            Command::Scale {
                node_pool,
                new_node_count,
                cordon_drain_timeout,
                template,
            } => {
                require("--node-pool", &node_pool)?;
                if new_node_count == 0 {
                    return Err(AkupError::InvalidConfig(
                        "--new-node-count must be at least 1".to_string(),
                    ));
                }
                Operation::Scale(ScaleOptions {
                    node_pool,
                    new_node_count,
                    cordon_drain_timeout: minutes("--cordon-drain-timeout", cordon_drain_timeout)?,
                    template,
                })
            }
        };

        Ok(Self {
            subscription_id: args.subscription_id,
            resource_group: args.resource_group,
            resource_manager_endpoint: args.resource_manager_endpoint,
            access_token: SecretString::from(args.access_token),
            api_model: args.api_model,
            kubeconfig: args.kubeconfig,
            api_server: args.apiserver,
            yes: args.yes,
            log_level: args.log_level,
            log_format: args.log_format,
            operation,
        })
    }
}

fn require(flag: &str, value: &str) -> Result<(), AkupError> {
    if value.trim().is_empty() {
        return Err(AkupError::InvalidConfig(format!("{} is required", flag)));
    }
    Ok(())
}

fn minutes(flag: &str, value: u64) -> Result<Duration, AkupError> {
    if value == 0 {
        return Err(AkupError::InvalidConfig(format!("{} must be greater than 0", flag)));
    }
    Ok(Duration::from_secs(value * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Config, AkupError> {
        let mut argv = vec![
            "akup",
            "--subscription-id",
            "sub",
            "-g",
            "rg",
            "--access-token",
            "token",
        ];
        argv.extend_from_slice(extra);
        Config::from_args(Args::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_upgrade_defaults() {
        let config = parse(&["upgrade", "--upgrade-version", "v1.18.10"]).unwrap();
        let Operation::Upgrade(options) = config.operation else {
            panic!("Expected upgrade operation");
        };
        assert_eq!(options.upgrade_version, "1.18.10");
        assert_eq!(options.vm_timeout, Duration::from_secs(20 * 60));
        assert_eq!(options.cordon_drain_timeout, Duration::from_secs(20 * 60));
        assert!(!options.force);
        assert!(!options.control_plane_only);
        assert_eq!(options.template.template, PathBuf::from("_output/azuredeploy.json"));
        assert_eq!(config.resource_manager_endpoint, DEFAULT_RESOURCE_MANAGER_ENDPOINT);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_upgrade_flags() {
        let config = parse(&[
            "upgrade",
            "--upgrade-version",
            "1.18.10",
            "--force",
            "--control-plane-only",
            "--vm-timeout",
            "5",
            "--log-format",
            "json",
        ])
        .unwrap();
        let Operation::Upgrade(options) = config.operation else {
            panic!("Expected upgrade operation");
        };
        assert!(options.force);
        assert!(options.control_plane_only);
        assert_eq!(options.vm_timeout, Duration::from_secs(300));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_scale_flags() {
        let config = parse(&["scale", "--node-pool", "linuxpool", "-c", "5"]).unwrap();
        let Operation::Scale(options) = config.operation else {
            panic!("Expected scale operation");
        };
        assert_eq!(options.node_pool, "linuxpool");
        assert_eq!(options.new_node_count, 5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse(&["scale", "--node-pool", "linuxpool", "-c", "0"]).is_err());
        assert!(parse(&["upgrade", "--upgrade-version", "1.18.10", "--vm-timeout", "0"]).is_err());
        assert!(parse(&["upgrade", "--upgrade-version", " "]).is_err());
    }

    #[test]
    fn test_missing_resource_group_rejected() {
        let args = Args::try_parse_from([
            "akup",
            "--subscription-id",
            "sub",
            "--access-token",
            "token",
            "upgrade",
            "--upgrade-version",
            "1.18.10",
        ])
        .unwrap();
        let err = Config::from_args(args).unwrap_err();
        assert_eq!(err.to_string(), "Invalid configuration: --resource-group is required");
    }
}
