//! Apply operations and the executor that runs them
//!
//! A round is a batch of [`ApplyOperation`]s, one per candidate namespace
//! per artifact. A producer task feeds them into a bounded work channel; the
//! executor runs at most `capacity` of them at a time and reports exactly one
//! [`ApplyResult`] per operation, whether it ran, timed out or was never sent.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use certificator_common::{
    Error, Result, ANNOTATION_LAST_APPLIED, FIELD_MANAGER, LABEL_MANAGED_BY, MANAGED_BY,
};

use crate::artifact::Artifact;

/// Writes one artifact into one namespace, creating or updating it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplySink: Send + Sync {
    /// Create or update the artifact's ConfigMap in `namespace`
    async fn apply(&self, namespace: &str, artifact: &Artifact) -> Result<()>;
}

/// Stores artifacts as ConfigMaps through the Kubernetes API
pub struct KubeConfigMapSink {
    client: Client,
}

impl KubeConfigMapSink {
    /// Create a sink using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Build the ConfigMap holding `artifact` in `namespace`
pub fn build_config_map(namespace: &str, artifact: &Artifact, now: DateTime<Utc>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(artifact.resource_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                MANAGED_BY.to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_LAST_APPLIED.to_string(),
                now.to_rfc3339_opts(SecondsFormat::Secs, true),
            )])),
            ..Default::default()
        },
        binary_data: Some(BTreeMap::from([(
            artifact.filename.clone(),
            ByteString(artifact.payload.as_ref().clone()),
        )])),
        ..Default::default()
    }
}

#[async_trait]
impl ApplySink for KubeConfigMapSink {
    async fn apply(&self, namespace: &str, artifact: &Artifact) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = build_config_map(namespace, artifact, Utc::now());
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        let to_apply_error =
            |e: kube::Error| Error::apply(namespace, &artifact.resource_name, e.to_string());

        match api.create(&params, &config_map).await {
            Ok(_) => {
                debug!(namespace = %namespace, configmap = %artifact.resource_name, "Created ConfigMap");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Already exists, replace it
                api.replace(&artifact.resource_name, &params, &config_map)
                    .await
                    .map_err(to_apply_error)?;
                debug!(namespace = %namespace, configmap = %artifact.resource_name, "Updated ConfigMap");
                Ok(())
            }
            Err(e) => Err(to_apply_error(e)),
        }
    }
}

/// Push one artifact into one namespace
#[derive(Debug, Clone)]
pub struct ApplyOperation {
    /// Round that generated the operation
    pub round: u64,
    /// Target namespace
    pub namespace: String,
    /// Artifact to write
    pub artifact: Artifact,
    /// Round deadline; the operation fails once it passes
    pub deadline: Instant,
    /// Round token; a cancelled operation is reported without running
    pub cancel: CancellationToken,
}

impl ApplyOperation {
    /// Run against `sink`, bounded by the round deadline
    pub async fn execute(self, sink: &dyn ApplySink) -> ApplyResult {
        let outcome = if self.cancel.is_cancelled() {
            Err(self.failure("cancelled before start"))
        } else {
            match timeout_at(self.deadline, sink.apply(&self.namespace, &self.artifact)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(self.failure("apply timeout exceeded")),
            }
        };
        self.into_result(outcome)
    }

    fn failure(&self, message: &str) -> Error {
        Error::apply(&self.namespace, &self.artifact.resource_name, message)
    }

    fn into_result(self, outcome: Result<()>) -> ApplyResult {
        ApplyResult {
            round: self.round,
            namespace: self.namespace,
            resource: self.artifact.resource_name,
            outcome,
        }
    }
}

/// Outcome of one [`ApplyOperation`]
#[derive(Debug)]
pub struct ApplyResult {
    /// Round that generated the operation
    pub round: u64,
    /// Target namespace
    pub namespace: String,
    /// ConfigMap name
    pub resource: String,
    /// Success, or why it failed
    pub outcome: Result<()>,
}

impl ApplyResult {
    /// True when the artifact was written
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Runs operations from the work channel with bounded concurrency
pub struct ApplyExecutor {
    work_tx: mpsc::Sender<ApplyOperation>,
    handle: JoinHandle<()>,
}

impl ApplyExecutor {
    /// Start the executor
    ///
    /// Both the work channel and the number of concurrently running
    /// operations are bounded by `capacity`.
    pub fn spawn(
        sink: Arc<dyn ApplySink>,
        capacity: usize,
        results_tx: mpsc::Sender<ApplyResult>,
    ) -> Self {
        let (work_tx, work_rx) = mpsc::channel(capacity);
        let semaphore = Arc::new(Semaphore::new(capacity));
        let handle = tokio::spawn(run_executor(sink, work_rx, semaphore, results_tx));
        Self { work_tx, handle }
    }

    /// Sender side of the work channel, for round producers
    pub fn sender(&self) -> mpsc::Sender<ApplyOperation> {
        self.work_tx.clone()
    }

    /// Close the work channel and wait for queued operations to be handed out
    pub async fn shutdown(self) {
        drop(self.work_tx);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Apply executor task failed");
        }
    }
}

async fn run_executor(
    sink: Arc<dyn ApplySink>,
    mut work_rx: mpsc::Receiver<ApplyOperation>,
    semaphore: Arc<Semaphore>,
    results_tx: mpsc::Sender<ApplyResult>,
) {
    while let Some(op) = work_rx.recv().await {
        // Holding off the next receive while every permit is taken lets the
        // work channel fill up and block the producer.
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let sink = sink.clone();
        let results_tx = results_tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result = op.execute(sink.as_ref()).await;
            // The reconciler is gone once the channel is closed
            let _ = results_tx.send(result).await;
        });
    }
    debug!("Apply executor stopped");
}

/// Feed a round into the work channel
///
/// Blocks on a full channel. Once `cancel` fires, the round deadline passes
/// or the executor is gone, every operation not yet sent is reported as a
/// failure so that each operation still yields exactly one result.
pub async fn produce_round(
    ops: Vec<ApplyOperation>,
    work_tx: mpsc::Sender<ApplyOperation>,
    cancel: CancellationToken,
    results_tx: mpsc::Sender<ApplyResult>,
) {
    let mut pending = ops.into_iter();
    while let Some(op) = pending.next() {
        let reason = tokio::select! {
            biased;
            _ = cancel.cancelled() => "round cancelled before dispatch",
            _ = tokio::time::sleep_until(op.deadline) => "apply timeout exceeded before dispatch",
            permit = work_tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(op);
                    continue;
                }
                Err(_) => "apply executor stopped",
            },
        };

        for unsent in std::iter::once(op).chain(pending.by_ref()) {
            let failure = unsent.failure(reason);
            if results_tx.send(unsent.into_result(Err(failure))).await.is_err() {
                return;
            }
        }
    }
}
