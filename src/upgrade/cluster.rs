//! Upgrade run driver.
//!
//! Discovers the cluster VMs, connects to the cluster, pauses the
//! cluster-autoscaler while agent pools are replaced and hands the topology
//! to an [`UpgradeWorkflow`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::template::DeploymentTemplate;
use super::topology::{Classifier, ClusterTopology};
use super::versions::SupportedVersions;
use super::workflow::{AvailabilitySetWorkflow, UpgradeSettings, UpgradeWorkflow};
use crate::apimodel::{ApiModel, CLUSTER_AUTOSCALER_ADDON};
use crate::azure::client::ResourceClient;
use crate::k8s::autoscaler::{self, set_cluster_autoscaler_replica_count};
use crate::k8s::client::{KubernetesClient, KubernetesConnector};
use crate::retry::RetryConfig;

/// Everything one upgrade invocation needs.
pub struct UpgradeCluster {
    resource_client: Arc<dyn ResourceClient>,
    connector: Arc<dyn KubernetesConnector>,
    settings: UpgradeSettings,
    versions: SupportedVersions,
    api_server_url: String,
    kubeconfig: String,
    autoscaler_retry: RetryConfig,
}

impl UpgradeCluster {
    pub fn new(
        resource_client: Arc<dyn ResourceClient>,
        connector: Arc<dyn KubernetesConnector>,
        settings: UpgradeSettings,
        versions: SupportedVersions,
        api_server_url: &str,
        kubeconfig: &str,
    ) -> Self {
        Self {
            resource_client,
            connector,
            settings,
            versions,
            api_server_url: api_server_url.to_string(),
            kubeconfig: kubeconfig.to_string(),
            autoscaler_retry: autoscaler::default_retry(),
        }
    }

    #[cfg(test)]
    pub fn with_autoscaler_retry(mut self, retry: RetryConfig) -> Self {
        self.autoscaler_retry = retry;
        self
    }

    /// List the resource group's VMs and classify them against the target version.
    ///
    /// Only VMs carrying `name_suffix` are considered. The target version is checked against the api model before any VM is
    /// looked at, so an unsupported path fails without touching the cluster.
    pub async fn discover(&self, model: &ApiModel, name_suffix: &str) -> Result<ClusterTopology> {
        let target = &self.settings.upgrade_version;
        self.versions
            .check_upgrade_path(model.orchestrator_version(), target, self.settings.force)?;

        let vms = self
            .resource_client
            .list_virtual_machines(&self.settings.resource_group)
            .await
            .context("Error while querying ARM for resources")?;

        let mut topology = ClusterTopology::from_model(model, name_suffix);
        let classifier = Classifier {
            target_version: target,
            force: self.settings.force,
            versions: &self.versions,
        };
        topology.classify(vms, &classifier)?;

        info!(
            pending_masters = topology.master_vms.len(),
            upgraded_masters = topology.upgraded_master_vms.len(),
            pools = topology.agent_pools.len(),
            "Discovered cluster VMs"
        );
        Ok(topology)
    }

    /// Build a client for the target cluster.
    ///
    /// Without `force` a connection failure aborts the run. With it the
    /// upgrade continues without draining, readiness checks or metadata copy.
    pub async fn connect(&self) -> Result<Option<Arc<dyn KubernetesClient>>> {
        match self
            .connector
            .connect(&self.api_server_url, &self.kubeconfig)
            .await
        {
            Ok(client) => Ok(Some(client)),
            Err(e) => {
                warn!("Failed to get a Kubernetes client: {:#}", e);
                if self.settings.force {
                    Ok(None)
                } else {
                    Err(e.context("Failed to get a Kubernetes client"))
                }
            }
        }
    }

    /// Connect and run the availability-set workflow over `topology`.
    pub async fn upgrade(
        &self,
        model: &ApiModel,
        topology: &mut ClusterTopology,
        template: DeploymentTemplate,
    ) -> Result<()> {
        let kube = self.connect().await?;
        let workflow = AvailabilitySetWorkflow::new(
            self.resource_client.clone(),
            kube.clone(),
            template,
            self.settings.clone(),
        );
        self.run_workflow(model, topology, kube, &workflow).await
    }

    /// Run `workflow` with the cluster-autoscaler paused around it.
    ///
    /// The autoscaler is resumed even when the workflow fails.
    pub async fn run_workflow(
        &self,
        model: &ApiModel,
        topology: &mut ClusterTopology,
        kube: Option<Arc<dyn KubernetesClient>>,
        workflow: &dyn UpgradeWorkflow,
    ) -> Result<()> {
        let paused = self.pause_autoscaler(model, kube.as_deref()).await?;

        let result = async {
            workflow.validate(topology)?;
            workflow.run_upgrade(topology).await
        }
        .await;

        if let Some(replicas) = paused {
            info!("Resuming cluster autoscaler, replica count: {}", replicas);
            if let Err(e) =
                set_cluster_autoscaler_replica_count(kube.as_deref(), replicas, &self.autoscaler_retry)
                    .await
            {
                warn!("Failed to resume cluster-autoscaler: {:#}", e);
                if result.is_ok() && !self.settings.force {
                    return Err(e.context("Failed to resume cluster-autoscaler"));
                }
            }
        }

        result
    }

    /// Scale the autoscaler to zero and return its previous replica count.
    ///
    /// Skipped when the addon is disabled or only the control plane is upgraded.
    async fn pause_autoscaler(
        &self,
        model: &ApiModel,
        kube: Option<&dyn KubernetesClient>,
    ) -> Result<Option<i32>> {
        if !model.is_addon_enabled(CLUSTER_AUTOSCALER_ADDON) || self.settings.control_plane_only {
            return Ok(None);
        }

        info!("Pausing cluster autoscaler, replica count: 0");
        match set_cluster_autoscaler_replica_count(kube, 0, &self.autoscaler_retry).await {
            Ok(previous) => Ok(Some(previous)),
            Err(e) if self.settings.force => {
                warn!("Failed to pause cluster-autoscaler: {:#}", e);
                Ok(None)
            }
            Err(e) => Err(e.context("Failed to pause cluster-autoscaler")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::azure::types::NAME_SUFFIX_TAG;
    use crate::testing::{
        FakeConnector, FakeKubernetesClient, FakeResourceClient, Op, SUFFIX, agent_vm,
        capture_logs, deployment, master_vm, vm,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct StubWorkflow {
        runs: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl UpgradeWorkflow for StubWorkflow {
        fn validate(&self, _topology: &ClusterTopology) -> Result<()> {
            Ok(())
        }

        async fn run_upgrade(&self, _topology: &mut ClusterTopology) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("workflow failed");
            }
            Ok(())
        }
    }

    fn model(autoscaler: bool) -> ApiModel {
        serde_json::from_value(json!({
            "apiVersion": "vlabs",
            "properties": {
                "orchestratorProfile": {
                    "orchestratorVersion": "1.17.11",
                    "kubernetesConfig": {
                        "addons": [{ "name": "cluster-autoscaler", "enabled": autoscaler }]
                    }
                },
                "masterProfile": { "count": 1 },
                "agentPoolProfiles": [{ "name": "agentpool1", "count": 1 }]
            }
        }))
        .unwrap()
    }

    fn versions() -> SupportedVersions {
        [("1.17.11", true), ("1.18.10", true)]
            .iter()
            .map(|(v, s)| (v.to_string(), *s))
            .collect()
    }

    struct Harness {
        resources: Arc<FakeResourceClient>,
        kube: Arc<FakeKubernetesClient>,
        connector: Arc<FakeConnector>,
    }

    impl Harness {
        fn new() -> Self {
            let resources = Arc::new(FakeResourceClient::with_vms(vec![
                master_vm(0, "1.17.11"),
                agent_vm("agentpool1", 0, "1.17.11"),
            ]));
            let kube = Arc::new(FakeKubernetesClient::new());
            kube.set_deployment(deployment("cluster-autoscaler", 3));
            let connector = Arc::new(FakeConnector::new(kube.clone()));
            Self {
                resources,
                kube,
                connector,
            }
        }

        fn cluster(&self, configure: impl FnOnce(&mut UpgradeSettings)) -> UpgradeCluster {
            let mut settings = UpgradeSettings::new("1.18.10", "rg");
            settings.node_ready_interval = Duration::from_millis(1);
            configure(&mut settings);
            UpgradeCluster::new(
                self.resources.clone(),
                self.connector.clone(),
                settings,
                versions(),
                "https://cluster.local",
                "kubeconfig",
            )
            .with_autoscaler_retry(RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                backoff_multiplier: 1.0,
            })
        }

        fn replicas(&self) -> Option<i32> {
            self.kube.deployment().and_then(|d| d.spec).and_then(|s| s.replicas)
        }
    }

    #[tokio::test]
    async fn test_list_failure_message() {
        let harness = Harness::new();
        harness.resources.faults.always(Op::ListVirtualMachines);

        let err = harness
            .cluster(|_| {})
            .discover(&model(false), SUFFIX)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Error while querying ARM for resources");
    }

    #[tokio::test]
    async fn test_unsupported_target_fails_before_listing() {
        let harness = Harness::new();
        let cluster = harness.cluster(|s| s.upgrade_version = "1.17.11".to_string());

        let err = cluster.discover(&model(false), SUFFIX).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "upgrading from Kubernetes version 1.17.11 to version 1.17.11 is not supported"
        );

        let cluster = harness.cluster(|s| {
            s.upgrade_version = "1.17.11".to_string();
            s.force = true;
        });
        let topology = cluster.discover(&model(false), SUFFIX).await.unwrap();
        assert_eq!(topology.master_vms.len(), 1);
    }

    #[tokio::test]
    async fn test_discover_classifies_vms() {
        let harness = Harness::new();
        let topology = harness
            .cluster(|_| {})
            .discover(&model(false), SUFFIX)
            .await
            .unwrap();
        assert_eq!(topology.master_vms.len(), 1);
        assert_eq!(topology.agent_pools["agentpool1"].agent_vms.len(), 1);
        assert_eq!(topology.pending_count(false), 2);
    }

    #[tokio::test]
    async fn test_discover_ignores_other_cluster_listed_first() {
        let mut harness = Harness::new();
        let mut foreign = vm("k8s-master-87654321-0", None, "1.17.11");
        foreign
            .tags
            .insert(NAME_SUFFIX_TAG.to_string(), "87654321".to_string());
        harness.resources = Arc::new(FakeResourceClient::with_vms(vec![
            foreign,
            master_vm(0, "1.17.11"),
            agent_vm("agentpool1", 0, "1.17.11"),
        ]));

        let topology = harness
            .cluster(|_| {})
            .discover(&model(false), SUFFIX)
            .await
            .unwrap();
        assert_eq!(topology.name_suffix, SUFFIX);
        assert_eq!(topology.master_vms.len(), 1);
        assert_eq!(topology.master_vms[0].name, "k8s-master-12345678-0");
        assert_eq!(topology.pending_count(false), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_requires_force() {
        let harness = Harness::new();
        harness.connector.faults.always(Op::Connect);
        let (logs, _guard) = capture_logs();

        assert!(harness.cluster(|_| {}).connect().await.is_err());
        assert!(logs.contains("Failed to get a Kubernetes client"));

        let client = harness.cluster(|s| s.force = true).connect().await.unwrap();
        assert!(client.is_none());
    }

    #[tokio::test]
    async fn test_autoscaler_paused_and_resumed() {
        let harness = Harness::new();
        let cluster = harness.cluster(|_| {});
        let model = model(true);
        let mut topology = cluster.discover(&model, SUFFIX).await.unwrap();
        let workflow = StubWorkflow::default();
        let (logs, _guard) = capture_logs();

        cluster
            .run_workflow(&model, &mut topology, Some(harness.kube.clone()), &workflow)
            .await
            .unwrap();

        assert_eq!(workflow.runs.load(Ordering::SeqCst), 1);
        assert!(logs.contains("Pausing cluster autoscaler"));
        assert!(logs.contains("Resuming cluster autoscaler, replica count: 3"));
        assert_eq!(harness.replicas(), Some(3));
    }

    #[tokio::test]
    async fn test_autoscaler_resumed_after_workflow_failure() {
        let harness = Harness::new();
        let cluster = harness.cluster(|_| {});
        let model = model(true);
        let mut topology = ClusterTopology::default();
        let workflow = StubWorkflow {
            fail: true,
            ..Default::default()
        };
        let (logs, _guard) = capture_logs();

        let err = cluster
            .run_workflow(&model, &mut topology, Some(harness.kube.clone()), &workflow)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "workflow failed");
        assert!(logs.contains("Resuming cluster autoscaler"));
        assert_eq!(harness.replicas(), Some(3));
    }

    #[tokio::test]
    async fn test_autoscaler_skipped_when_disabled_or_control_plane_only() {
        let harness = Harness::new();
        let (logs, _guard) = capture_logs();
        let workflow = StubWorkflow::default();
        let mut topology = ClusterTopology::default();

        harness
            .cluster(|_| {})
            .run_workflow(&model(false), &mut topology, Some(harness.kube.clone()), &workflow)
            .await
            .unwrap();
        harness
            .cluster(|s| s.control_plane_only = true)
            .run_workflow(&model(true), &mut topology, Some(harness.kube.clone()), &workflow)
            .await
            .unwrap();

        assert_eq!(workflow.runs.load(Ordering::SeqCst), 2);
        assert!(!logs.contains("Pausing cluster autoscaler"));
        assert!(!logs.contains("Resuming cluster autoscaler"));
    }

    #[tokio::test]
    async fn test_pause_failure_aborts_without_force() {
        let harness = Harness::new();
        harness.kube.faults.always(Op::UpdateDeployment);
        let workflow = StubWorkflow::default();
        let mut topology = ClusterTopology::default();
        let (logs, _guard) = capture_logs();

        let err = harness
            .cluster(|_| {})
            .run_workflow(&model(true), &mut topology, Some(harness.kube.clone()), &workflow)
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("Failed to pause cluster-autoscaler"));
        assert_eq!(workflow.runs.load(Ordering::SeqCst), 0);
        assert_eq!(logs.count("Failed to update cluster-autoscaler"), 3);
        assert_eq!(logs.count("Retry updating cluster-autoscaler"), 2);
    }

    #[tokio::test]
    async fn test_pause_failure_tolerated_with_force() {
        let harness = Harness::new();
        let workflow = StubWorkflow::default();
        let mut topology = ClusterTopology::default();
        let (logs, _guard) = capture_logs();

        harness
            .cluster(|s| s.force = true)
            .run_workflow(&model(true), &mut topology, None, &workflow)
            .await
            .unwrap();

        assert!(logs.contains("Pausing cluster autoscaler"));
        assert!(logs.contains("Failed to pause cluster-autoscaler"));
        assert!(!logs.contains("Resuming cluster autoscaler"));
        assert_eq!(workflow.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upgrade_end_to_end() {
        let harness = Harness::new();
        let cluster = harness.cluster(|_| {});
        let model = model(true);
        let mut topology = cluster.discover(&model, SUFFIX).await.unwrap();
        let template = DeploymentTemplate {
            template: json!({}),
            parameters: json!({}),
        };

        cluster.upgrade(&model, &mut topology, template).await.unwrap();

        assert_eq!(topology.pending_count(false), 0);
        assert_eq!(harness.resources.deployments().len(), 2);
        assert_eq!(harness.replicas(), Some(3));
    }
}
