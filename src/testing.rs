//! In-memory fakes for the cloud and Kubernetes clients, plus log capture.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde_json::Value;
use tracing_subscriber::fmt::MakeWriter;

use crate::azure::client::ResourceClient;
use crate::azure::types::VirtualMachine;
use crate::error::AkupError;
use crate::k8s::client::{KubernetesClient, KubernetesConnector};

pub const SUFFIX: &str = "12345678";

/// Operations a fake can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ListVirtualMachines,
    GetVirtualMachine,
    DeleteVirtualMachine,
    DeleteNetworkInterface,
    DeleteManagedDisk,
    DeployTemplate,
    Connect,
    ListNodes,
    GetNode,
    UpdateNode,
    UpdateNodeConflict,
    ListPods,
    SupportsEviction,
    EvictPod,
    EvictPodTooManyRequests,
    DeletePod,
    WaitForDelete,
    GetDeployment,
    UpdateDeployment,
}

/// Remaining failure counts per operation. `u32::MAX` means fail forever.
#[derive(Debug, Default)]
pub struct Faults(Mutex<HashMap<Op, u32>>);

impl Faults {
    pub fn set(&self, op: Op, times: u32) {
        self.0.lock().unwrap().insert(op, times);
    }

    pub fn always(&self, op: Op) {
        self.set(op, u32::MAX);
    }

    fn trip(&self, op: Op) -> bool {
        let mut faults = self.0.lock().unwrap();
        match faults.get_mut(&op) {
            Some(0) | None => false,
            Some(n) => {
                if *n != u32::MAX {
                    *n -= 1;
                }
                true
            }
        }
    }

    fn check(&self, op: Op) -> Result<()> {
        if self.trip(op) {
            Err(anyhow!("{:?} failed", op))
        } else {
            Ok(())
        }
    }
}

pub fn vm(name: &str, pool: Option<&str>, version: &str) -> VirtualMachine {
    let index = name.rsplit('-').next().unwrap_or("0");
    let prefix = name.rsplitn(2, '-').nth(1).unwrap_or(name);
    let mut value = serde_json::json!({
        "id": format!("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/{}", name),
        "name": name,
        "tags": {
            "orchestrator": format!("Kubernetes:{}", version),
            "resourceNameSuffix": SUFFIX
        },
        "properties": {
            "provisioningState": "Succeeded",
            "storageProfile": {
                "osDisk": {
                    "name": format!("{}_OsDisk_1", name),
                    "osType": "Linux",
                    "managedDisk": {
                        "id": format!("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/{}_OsDisk_1", name)
                    }
                }
            },
            "networkProfile": {
                "networkInterfaces": [
                    { "id": format!("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/networkInterfaces/{}-nic-{}", prefix, index) }
                ]
            }
        }
    });
    if let Some(pool) = pool {
        value["tags"]["poolName"] = Value::String(pool.to_string());
    }
    serde_json::from_value(value).unwrap()
}

pub fn agent_vm(pool: &str, index: usize, version: &str) -> VirtualMachine {
    vm(&format!("k8s-{}-{}-{}", pool, SUFFIX, index), Some(pool), version)
}

pub fn master_vm(index: usize, version: &str) -> VirtualMachine {
    vm(&format!("k8s-master-{}-{}", SUFFIX, index), None, version)
}

pub fn node(name: &str, ready: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod(name: &str, owner_kind: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            owner_references: owner_kind.map(|kind| {
                vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: kind.to_string(),
                    name: format!("{}-owner", name),
                    uid: format!("{}-uid", name),
                    controller: Some(true),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn deployment(name: &str, replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A recorded template deployment.
#[derive(Debug, Clone)]
pub struct RecordedDeployment {
    pub name: String,
    pub parameters: Value,
}

#[derive(Default)]
pub struct FakeResourceClient {
    vms: Mutex<Vec<VirtualMachine>>,
    calls: Mutex<Vec<String>>,
    deployments: Mutex<Vec<RecordedDeployment>>,
    pub faults: Faults,
}

impl FakeResourceClient {
    pub fn with_vms(vms: Vec<VirtualMachine>) -> Self {
        Self {
            vms: Mutex::new(vms),
            ..Default::default()
        }
    }

    pub fn vms(&self) -> Vec<VirtualMachine> {
        self.vms.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deployments(&self) -> Vec<RecordedDeployment> {
        self.deployments.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ResourceClient for FakeResourceClient {
    async fn list_virtual_machines(&self, _resource_group: &str) -> Result<Vec<VirtualMachine>> {
        self.faults.check(Op::ListVirtualMachines)?;
        Ok(self.vms())
    }

    async fn get_virtual_machine(
        &self,
        _resource_group: &str,
        name: &str,
    ) -> Result<VirtualMachine> {
        self.record(format!("get {}", name));
        self.faults.check(Op::GetVirtualMachine)?;
        self.vms()
            .into_iter()
            .find(|vm| vm.name == name)
            .ok_or_else(|| AkupError::NotFound(name.to_string()).into())
    }

    async fn delete_virtual_machine(&self, _resource_group: &str, name: &str) -> Result<()> {
        self.record(format!("delete-vm {}", name));
        self.faults.check(Op::DeleteVirtualMachine)?;
        self.vms.lock().unwrap().retain(|vm| vm.name != name);
        Ok(())
    }

    async fn delete_network_interface(&self, _resource_group: &str, name: &str) -> Result<()> {
        self.record(format!("delete-nic {}", name));
        self.faults.check(Op::DeleteNetworkInterface)
    }

    async fn delete_managed_disk(&self, _resource_group: &str, name: &str) -> Result<()> {
        self.record(format!("delete-disk {}", name));
        self.faults.check(Op::DeleteManagedDisk)
    }

    async fn deploy_template(
        &self,
        _resource_group: &str,
        deployment_name: &str,
        _template: &Value,
        parameters: &Value,
    ) -> Result<()> {
        self.record(format!("deploy {}", deployment_name));
        self.faults.check(Op::DeployTemplate)?;
        self.deployments.lock().unwrap().push(RecordedDeployment {
            name: deployment_name.to_string(),
            parameters: parameters.clone(),
        });
        Ok(())
    }
}

/// In-memory Kubernetes API.
///
/// Nodes that were never stored are reported as existing and Ready, so a
/// freshly deployed VM registers immediately.
#[derive(Default)]
pub struct FakeKubernetesClient {
    nodes: Mutex<BTreeMap<String, Node>>,
    node_snapshots: Mutex<VecDeque<Vec<Node>>>,
    pods: Mutex<Vec<Pod>>,
    deployment: Mutex<Option<Deployment>>,
    supports_eviction: Mutex<bool>,
    calls: Mutex<Vec<String>>,
    list_node_calls: Mutex<u32>,
    pub faults: Faults,
}

impl FakeKubernetesClient {
    pub fn new() -> Self {
        Self {
            supports_eviction: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes.lock().unwrap().insert(name, node);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// Queue `list_nodes` answers. The last one repeats once the queue drains.
    pub fn push_node_snapshot(&self, nodes: Vec<Node>) {
        self.node_snapshots.lock().unwrap().push_back(nodes);
    }

    pub fn list_node_calls(&self) -> u32 {
        *self.list_node_calls.lock().unwrap()
    }

    pub fn set_pods(&self, pods: Vec<Pod>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn set_supports_eviction(&self, supported: bool) {
        *self.supports_eviction.lock().unwrap() = supported;
    }

    pub fn set_deployment(&self, deployment: Deployment) {
        *self.deployment.lock().unwrap() = Some(deployment);
    }

    pub fn deployment(&self) -> Option<Deployment> {
        self.deployment.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl KubernetesClient for FakeKubernetesClient {
    async fn list_nodes(&self, _label_selector: Option<&str>) -> Result<Vec<Node>> {
        *self.list_node_calls.lock().unwrap() += 1;
        self.faults.check(Op::ListNodes)?;

        let mut snapshots = self.node_snapshots.lock().unwrap();
        if snapshots.len() > 1 {
            return Ok(snapshots.pop_front().unwrap_or_default());
        }
        if let Some(last) = snapshots.front() {
            return Ok(last.clone());
        }
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.record(format!("get-node {}", name));
        self.faults.check(Op::GetNode)?;
        Ok(self
            .node(name)
            .unwrap_or_else(|| node(name, true)))
    }

    async fn update_node(&self, updated: &Node) -> Result<Node> {
        let name = updated.metadata.name.clone().unwrap_or_default();
        self.record(format!("update-node {}", name));
        if self.faults.trip(Op::UpdateNodeConflict) {
            return Err(AkupError::Conflict(format!(
                "Operation cannot be fulfilled on nodes \"{}\": the object has been modified",
                name
            ))
            .into());
        }
        self.faults.check(Op::UpdateNode)?;
        self.add_node(updated.clone());
        Ok(updated.clone())
    }

    async fn list_pods(
        &self,
        _namespace: Option<&str>,
        _field_selector: Option<&str>,
    ) -> Result<Vec<Pod>> {
        self.faults.check(Op::ListPods)?;
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn supports_eviction(&self) -> Result<bool> {
        self.faults.check(Op::SupportsEviction)?;
        Ok(*self.supports_eviction.lock().unwrap())
    }

    async fn evict_pod(&self, pod: &Pod) -> Result<()> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.record(format!("evict {}", name));
        if self.faults.trip(Op::EvictPodTooManyRequests) {
            return Err(AkupError::TooManyRequests(format!("evict pod {}", name)).into());
        }
        self.faults.check(Op::EvictPod)
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        self.record(format!(
            "delete-pod {}",
            pod.metadata.name.as_deref().unwrap_or_default()
        ));
        self.faults.check(Op::DeletePod)
    }

    async fn wait_for_delete(
        &self,
        _pod: &Pod,
        _interval: Duration,
        _timeout: Duration,
    ) -> Result<()> {
        self.faults.check(Op::WaitForDelete)
    }

    async fn get_deployment(&self, _namespace: &str, name: &str) -> Result<Deployment> {
        self.faults.check(Op::GetDeployment)?;
        self.deployment()
            .ok_or_else(|| AkupError::NotFound(format!("deployment {}", name)).into())
    }

    async fn update_deployment(
        &self,
        _namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        self.faults.check(Op::UpdateDeployment)?;
        self.set_deployment(deployment.clone());
        Ok(deployment.clone())
    }
}

/// Hands out a shared [`FakeKubernetesClient`].
pub struct FakeConnector {
    pub client: Arc<FakeKubernetesClient>,
    pub faults: Faults,
}

impl FakeConnector {
    pub fn new(client: Arc<FakeKubernetesClient>) -> Self {
        Self {
            client,
            faults: Faults::default(),
        }
    }
}

#[async_trait]
impl KubernetesConnector for FakeConnector {
    async fn connect(
        &self,
        _api_server_url: &str,
        _kubeconfig: &str,
    ) -> Result<Arc<dyn KubernetesClient>> {
        self.faults.check(Op::Connect)?;
        Ok(self.client.clone())
    }
}

/// Captures formatted log output for assertions.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }

    pub fn count(&self, needle: &str) -> usize {
        self.contents().matches(needle).count()
    }
}

pub struct LogWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(self.0.clone())
    }
}

/// Install a thread-local subscriber writing into a [`LogCapture`].
///
/// Pair with a current-thread runtime so spawned tasks log on the same thread.
pub fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (capture, guard)
}
