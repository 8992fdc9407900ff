//! Kubernetes client abstraction and its kube-rs adapter.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, EvictParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, ResourceExt};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{AkupError, is_not_found};

/// The Kubernetes operations the orchestrator consumes.
#[async_trait]
pub trait KubernetesClient: Send + Sync {
    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    async fn update_node(&self, node: &Node) -> Result<Node>;

    /// List pods in one namespace, or across all namespaces when `namespace` is `None`.
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<Pod>>;

    /// Whether the server exposes the `pods/eviction` subresource.
    async fn supports_eviction(&self) -> Result<bool>;

    async fn evict_pod(&self, pod: &Pod) -> Result<()>;

    async fn delete_pod(&self, pod: &Pod) -> Result<()>;

    /// Poll until the pod is gone (or replaced by a pod with a new UID).
    async fn wait_for_delete(&self, pod: &Pod, interval: Duration, timeout: Duration)
    -> Result<()>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;

    async fn update_deployment(&self, namespace: &str, deployment: &Deployment)
    -> Result<Deployment>;
}

/// Builds a [`KubernetesClient`] for a cluster from its API server URL and kubeconfig.
#[async_trait]
pub trait KubernetesConnector: Send + Sync {
    async fn connect(
        &self,
        api_server_url: &str,
        kubeconfig: &str,
    ) -> Result<Arc<dyn KubernetesClient>>;
}

/// Connector backed by kube-rs.
#[derive(Debug, Default, Clone)]
pub struct KubeConnector;

#[async_trait]
impl KubernetesConnector for KubeConnector {
    async fn connect(
        &self,
        api_server_url: &str,
        kubeconfig: &str,
    ) -> Result<Arc<dyn KubernetesClient>> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig).context("Failed to parse kubeconfig")?;
        let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("Failed to load kubeconfig")?;

        if !api_server_url.is_empty() {
            config.cluster_url = api_server_url
                .parse()
                .context("Failed to parse API server URL")?;
        }

        let client =
            kube::Client::try_from(config).context("Failed to build Kubernetes client")?;
        debug!("Built Kubernetes client for {}", api_server_url);

        Ok(Arc::new(KubeClient::new(client)))
    }
}

/// [`KubernetesClient`] implementation over a kube-rs client.
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pod_api(&self, pod: &Pod) -> Api<Pod> {
        match pod.metadata.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

fn pod_ref(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.name_any()
    )
}

#[async_trait]
impl KubernetesClient for KubeClient {
    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = nodes
            .list(&params)
            .await
            .map_err(|e| AkupError::kube("list nodes", e))?;
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes
            .get(name)
            .await
            .map_err(|e| AkupError::kube(&format!("get node {}", name), e))?)
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let name = node.name_any();
        Ok(nodes
            .replace(&name, &PostParams::default(), node)
            .await
            .map_err(|e| AkupError::kube(&format!("update node {}", name), e))?)
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let mut params = ListParams::default();
        if let Some(selector) = field_selector {
            params = params.fields(selector);
        }
        let list = pods
            .list(&params)
            .await
            .map_err(|e| AkupError::kube("list pods", e))?;
        Ok(list.items)
    }

    async fn supports_eviction(&self) -> Result<bool> {
        let resources = self
            .client
            .list_core_api_resources("v1")
            .await
            .map_err(|e| AkupError::kube("discover core/v1 resources", e))?;
        Ok(resources
            .resources
            .iter()
            .any(|r| r.name == "pods/eviction"))
    }

    async fn evict_pod(&self, pod: &Pod) -> Result<()> {
        self.pod_api(pod)
            .evict(&pod.name_any(), &EvictParams::default())
            .await
            .map_err(|e| AkupError::kube(&format!("evict pod {}", pod_ref(pod)), e))?;
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        self.pod_api(pod)
            .delete(&pod.name_any(), &DeleteParams::default())
            .await
            .map_err(|e| AkupError::kube(&format!("delete pod {}", pod_ref(pod)), e))?;
        Ok(())
    }

    async fn wait_for_delete(
        &self,
        pod: &Pod,
        interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let api = self.pod_api(pod);
        let name = pod.name_any();
        let start = Instant::now();

        loop {
            match api.get(&name).await {
                Ok(current) if current.metadata.uid != pod.metadata.uid => return Ok(()),
                Ok(_) => debug!("Pod {} not yet deleted", pod_ref(pod)),
                Err(e) => {
                    let err: anyhow::Error =
                        AkupError::kube(&format!("get pod {}", pod_ref(pod)), e).into();
                    if is_not_found(&err) {
                        return Ok(());
                    }
                    debug!("Could not determine if pod {} is deleted: {}", pod_ref(pod), err);
                }
            }

            if start.elapsed() > timeout {
                return Err(AkupError::Timeout {
                    operation: format!("deletion of pod {}", pod_ref(pod)),
                    details: format!("exceeded {}s", timeout.as_secs()),
                }
                .into());
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments
            .get(name)
            .await
            .map_err(|e| AkupError::kube(&format!("get deployment {}/{}", namespace, name), e))?)
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = deployment.name_any();
        Ok(deployments
            .replace(&name, &PostParams::default(), deployment)
            .await
            .map_err(|e| {
                AkupError::kube(&format!("update deployment {}/{}", namespace, name), e)
            })?)
    }
}
