//! Control-plane health poller.
//!
//! Before the next control-plane VM is replaced, at most one of the already
//! upgraded control-plane nodes may be NotReady. Losing two at once risks
//! etcd quorum.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::AkupError;
use crate::k8s::client::KubernetesClient;
use crate::k8s::node::is_node_ready;
use crate::retry::RetryConfig;

/// Largest number of upgraded control-plane nodes allowed to be NotReady.
pub const MAX_NOT_READY_UPGRADED_MASTERS: usize = 1;

/// Names of upgraded nodes that are currently NotReady, in node-list order.
pub async fn upgraded_not_ready(
    client: &dyn KubernetesClient,
    upgraded_node_names: &[String],
) -> Result<Vec<String>> {
    let upgraded: HashSet<&str> = upgraded_node_names.iter().map(String::as_str).collect();
    let nodes = client.list_nodes(None).await?;

    Ok(nodes
        .iter()
        .filter_map(|node| {
            let name = node.metadata.name.as_deref()?;
            (upgraded.contains(name) && !is_node_ready(node)).then(|| name.to_string())
        })
        .collect())
}

/// Poll [`upgraded_not_ready`] with backoff and stream every answer.
///
/// Polling stops as soon as no upgraded node is NotReady, or once the
/// backoff's attempts are used up. A list error is sent and then retried.
/// The channel closes when polling stops.
pub fn upgraded_not_ready_stream(
    client: Arc<dyn KubernetesClient>,
    upgraded_node_names: Vec<String>,
    backoff: RetryConfig,
) -> mpsc::Receiver<Result<Vec<String>>> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let steps = backoff.max_attempts.max(1);
        for step in 1..=steps {
            let result = upgraded_not_ready(client.as_ref(), &upgraded_node_names).await;
            let done = matches!(&result, Ok(not_ready) if not_ready.is_empty());

            match &result {
                Ok(not_ready) => debug!(step = step, not_ready = ?not_ready, "Upgraded control plane status"),
                Err(e) => warn!(step = step, "Failed to list nodes: {:#}", e),
            }

            if tx.send(result).await.is_err() || done || step == steps {
                return;
            }
            tokio::time::sleep(backoff.delay_for(step)).await;
        }
    });

    rx
}

/// Fail if more than one upgraded control-plane node is NotReady.
///
/// Consumes snapshots until the stream ends or `timeout` passes, then judges
/// the last one. A stream that ends on a list error returns that error.
pub async fn check_control_plane_nodes_status(
    timeout: Duration,
    mut snapshots: mpsc::Receiver<Result<Vec<String>>>,
) -> Result<()> {
    let mut last: Option<Result<Vec<String>>> = None;

    let drain = async {
        while let Some(snapshot) = snapshots.recv().await {
            last = Some(snapshot);
        }
    };
    if tokio::time::timeout(timeout, drain).await.is_err() {
        debug!("Control plane status check timed out, using last snapshot");
    }

    match last {
        None => Ok(()),
        Some(Err(e)) => Err(e.context("Failed to check control plane node status")),
        Some(Ok(not_ready)) if not_ready.len() > MAX_NOT_READY_UPGRADED_MASTERS => {
            Err(AkupError::ControlPlaneNotReady(not_ready).into())
        }
        Some(Ok(_)) => Ok(()),
    }
}
