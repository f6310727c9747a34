//! Namespace discovery
//!
//! The reconciler consumes a stream of [`NamespaceEvent`]s. The stream may
//! end at any time; asking for a new one replays the current namespaces as
//! plain observations, which the registry treats as `lastSeen` refreshes.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use certificator_common::{Error, Result};

/// One observation of a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceEvent {
    /// Namespace name
    pub name: String,
    /// When the event was observed
    pub observed_at: DateTime<Utc>,
    /// The namespace is gone or terminating
    pub deleted: bool,
}

impl NamespaceEvent {
    /// The namespace exists
    pub fn observed(name: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            observed_at,
            deleted: false,
        }
    }

    /// The namespace was deleted
    pub fn deleted(name: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            observed_at,
            deleted: true,
        }
    }
}

/// Stream of namespace events; errors are reported in-band
pub type NamespaceEventStream = BoxStream<'static, Result<NamespaceEvent>>;

/// Source of namespace lifecycle events
pub trait NamespaceWatch: Send + Sync {
    /// Start a new watch
    ///
    /// Called again whenever a previous stream ended.
    fn watch(&self) -> NamespaceEventStream;
}

/// Watches cluster namespaces through the Kubernetes API
pub struct KubeNamespaceWatch {
    client: Client,
    label_selector: Option<String>,
}

impl KubeNamespaceWatch {
    /// Watch all namespaces, or only those matching `label_selector`
    pub fn new(client: Client, label_selector: Option<String>) -> Self {
        Self {
            client,
            label_selector,
        }
    }
}

impl NamespaceWatch for KubeNamespaceWatch {
    fn watch(&self) -> NamespaceEventStream {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let mut config = watcher::Config::default();
        if let Some(selector) = &self.label_selector {
            config = config.labels(selector);
        }

        info!(
            label_selector = self.label_selector.as_deref().unwrap_or(""),
            "Starting Kubernetes namespace watcher"
        );

        watcher::watcher(api, config)
            .default_backoff()
            .filter_map(|event| async move { namespace_event(event, Utc::now()) })
            .boxed()
    }
}

/// Translate a watcher event into a namespace event
///
/// Namespaces with a deletion timestamp are reported as deleted: they can no
/// longer receive new ConfigMaps.
pub(crate) fn namespace_event(
    event: std::result::Result<Event<Namespace>, watcher::Error>,
    now: DateTime<Utc>,
) -> Option<Result<NamespaceEvent>> {
    match event {
        Ok(Event::Apply(ns)) | Ok(Event::InitApply(ns)) => {
            let name = ns.name_any();
            if ns.metadata.deletion_timestamp.is_some() {
                Some(Ok(NamespaceEvent::deleted(name, now)))
            } else {
                Some(Ok(NamespaceEvent::observed(name, now)))
            }
        }
        Ok(Event::Delete(ns)) => Some(Ok(NamespaceEvent::deleted(ns.name_any(), now))),
        Ok(Event::Init) | Ok(Event::InitDone) => {
            debug!("Namespace watcher (re)listing");
            None
        }
        Err(e) => Some(Err(Error::watch(e.to_string()))),
    }
}
