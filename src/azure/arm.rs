//! ARM REST adapter for [`ResourceClient`].
//!
//! Talks to the Azure Resource Manager endpoint directly with reqwest so the
//! same client works against Azure Stack Hub, whose endpoint and API versions
//! differ from public Azure.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::client::ResourceClient;
use super::types::{VirtualMachine, VirtualMachineListResult};
use crate::error::AkupError;

pub const DEFAULT_RESOURCE_MANAGER_ENDPOINT: &str = "https://management.azure.com";

// API versions from the 2019-03-01-hybrid profile, supported by Azure Stack Hub.
const COMPUTE_API_VERSION: &str = "2017-03-30";
const NETWORK_API_VERSION: &str = "2017-10-01";
const RESOURCES_API_VERSION: &str = "2018-05-01";

const ASYNC_OPERATION_HEADER: &str = "azure-asyncoperation";
const LOCATION_HEADER: &str = "location";

/// Azure Resource Manager client for a single subscription.
pub struct ArmClient {
    http: reqwest::Client,
    endpoint: String,
    subscription_id: String,
    token: SecretString,
    poll_interval: Duration,
    operation_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

impl ErrorDetail {
    fn describe(&self) -> String {
        format!(
            "{}: {}",
            self.code.as_deref().unwrap_or("Unknown"),
            self.message.as_deref().unwrap_or("no message")
        )
    }
}

#[derive(Debug, Deserialize)]
struct AsyncOperationStatus {
    status: String,
    error: Option<ErrorDetail>,
}

impl ArmClient {
    pub fn new(
        endpoint: impl Into<String>,
        subscription_id: impl Into<String>,
        token: SecretString,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            subscription_id: subscription_id.into(),
            token,
            poll_interval: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(60 * 60),
        })
    }

    /// Override how long-running operations are polled.
    #[cfg(test)]
    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.operation_timeout = timeout;
        self
    }

    fn resource_url(
        &self,
        resource_group: &str,
        resource_type: &str,
        name: &str,
        api_version: &str,
    ) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/{}/{}?api-version={}",
            self.endpoint, self.subscription_id, resource_group, resource_type, name, api_version
        )
    }

    /// Send a request and map non-success statuses onto [`AkupError`].
    async fn send(&self, operation: &str, method: Method, url: &str, body: Option<&Value>) -> Result<Response> {
        debug!("ARM {} {}", method, url);

        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(self.token.expose_secret());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send ARM request for {}", operation))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .ok()
            .and_then(|r| r.error)
            .map(|e| e.describe())
            .unwrap_or(text);

        if status == StatusCode::NOT_FOUND {
            return Err(AkupError::NotFound(format!("{}: {}", operation, message)).into());
        }

        Err(AkupError::ArmApi {
            operation: operation.to_string(),
            status: status.as_u16(),
            message,
        }
        .into())
    }

    async fn delete_resource(&self, operation: &str, url: &str) -> Result<()> {
        let response = match self.send(operation, Method::DELETE, url, None).await {
            Ok(response) => response,
            Err(e) if crate::error::is_not_found(&e) => {
                debug!("{}: resource already deleted", operation);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if response.status() == StatusCode::ACCEPTED {
            self.wait_for_operation(operation, response.headers()).await?;
        }
        Ok(())
    }

    /// Follow the async-operation headers of a 201/202 response until a terminal status.
    async fn wait_for_operation(&self, operation: &str, headers: &HeaderMap) -> Result<bool> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        if let Some(url) = header(ASYNC_OPERATION_HEADER) {
            self.poll_async_operation(operation, &url).await?;
            return Ok(true);
        }
        if let Some(url) = header(LOCATION_HEADER) {
            self.poll_location(operation, &url).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn poll_async_operation(&self, operation: &str, url: &str) -> Result<()> {
        let start = Instant::now();
        loop {
            let status: AsyncOperationStatus = self
                .send(operation, Method::GET, url, None)
                .await?
                .json()
                .await
                .with_context(|| format!("Failed to parse operation status for {}", operation))?;

            match status.status.as_str() {
                "Succeeded" => return Ok(()),
                "Failed" | "Canceled" => {
                    return Err(AkupError::ArmApi {
                        operation: operation.to_string(),
                        status: 200,
                        message: status
                            .error
                            .map(|e| e.describe())
                            .unwrap_or_else(|| format!("operation {}", status.status)),
                    }
                    .into());
                }
                other => debug!("{}: operation status {}", operation, other),
            }

            self.sleep_or_timeout(operation, start).await?;
        }
    }

    async fn poll_location(&self, operation: &str, url: &str) -> Result<()> {
        let start = Instant::now();
        loop {
            let response = self.send(operation, Method::GET, url, None).await?;
            if response.status() != StatusCode::ACCEPTED {
                return Ok(());
            }
            self.sleep_or_timeout(operation, start).await?;
        }
    }

    async fn sleep_or_timeout(&self, operation: &str, start: Instant) -> Result<()> {
        if start.elapsed() > self.operation_timeout {
            return Err(AkupError::Timeout {
                operation: operation.to_string(),
                details: format!("exceeded {}s", self.operation_timeout.as_secs()),
            }
            .into());
        }
        tokio::time::sleep(self.poll_interval).await;
        Ok(())
    }

    async fn poll_deployment(&self, operation: &str, url: &str) -> Result<()> {
        let start = Instant::now();
        loop {
            let deployment: Value = self
                .send(operation, Method::GET, url, None)
                .await?
                .json()
                .await
                .with_context(|| format!("Failed to parse deployment for {}", operation))?;

            let properties = &deployment["properties"];
            match properties["provisioningState"].as_str().unwrap_or_default() {
                "Succeeded" => return Ok(()),
                state @ ("Failed" | "Canceled") => {
                    let message = serde_json::from_value::<ErrorDetail>(properties["error"].clone())
                        .map(|e| e.describe())
                        .unwrap_or_else(|_| format!("deployment {}", state));
                    return Err(AkupError::ArmApi {
                        operation: operation.to_string(),
                        status: 200,
                        message,
                    }
                    .into());
                }
                state => debug!("{}: provisioning state {}", operation, state),
            }

            self.sleep_or_timeout(operation, start).await?;
        }
    }
}

#[async_trait]
impl ResourceClient for ArmClient {
    async fn list_virtual_machines(&self, resource_group: &str) -> Result<Vec<VirtualMachine>> {
        let mut url = format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines?api-version={}",
            self.endpoint, self.subscription_id, resource_group, COMPUTE_API_VERSION
        );
        let mut vms = Vec::new();

        loop {
            let page: VirtualMachineListResult = self
                .send("ListVirtualMachines", Method::GET, &url, None)
                .await?
                .json()
                .await
                .context("Failed to parse virtual machine list")?;
            vms.extend(page.value);

            match page.next_link {
                Some(next) if !next.is_empty() => url = next,
                _ => break,
            }
        }

        debug!("Found {} VMs in resource group {}", vms.len(), resource_group);
        Ok(vms)
    }

    async fn get_virtual_machine(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<VirtualMachine> {
        let url = self.resource_url(
            resource_group,
            "Microsoft.Compute/virtualMachines",
            name,
            COMPUTE_API_VERSION,
        );
        self.send("GetVirtualMachine", Method::GET, &url, None)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse virtual machine {}", name))
    }

    async fn delete_virtual_machine(&self, resource_group: &str, name: &str) -> Result<()> {
        let url = self.resource_url(
            resource_group,
            "Microsoft.Compute/virtualMachines",
            name,
            COMPUTE_API_VERSION,
        );
        self.delete_resource("DeleteVirtualMachine", &url).await
    }

    async fn delete_network_interface(&self, resource_group: &str, name: &str) -> Result<()> {
        let url = self.resource_url(
            resource_group,
            "Microsoft.Network/networkInterfaces",
            name,
            NETWORK_API_VERSION,
        );
        self.delete_resource("DeleteNetworkInterface", &url).await
    }

    async fn delete_managed_disk(&self, resource_group: &str, name: &str) -> Result<()> {
        let url = self.resource_url(
            resource_group,
            "Microsoft.Compute/disks",
            name,
            COMPUTE_API_VERSION,
        );
        self.delete_resource("DeleteManagedDisk", &url).await
    }

    async fn deploy_template(
        &self,
        resource_group: &str,
        deployment_name: &str,
        template: &Value,
        parameters: &Value,
    ) -> Result<()> {
        let url = self.resource_url(
            resource_group,
            "Microsoft.Resources/deployments",
            deployment_name,
            RESOURCES_API_VERSION,
        );
        let body = json!({
            "properties": {
                "template": template,
                "parameters": parameters,
                "mode": "Incremental"
            }
        });

        let response = self
            .send("DeployTemplate", Method::PUT, &url, Some(&body))
            .await?;
        if !self.wait_for_operation("DeployTemplate", response.headers()).await? {
            self.poll_deployment("DeployTemplate", &url).await?;
        }
        Ok(())
    }
}
