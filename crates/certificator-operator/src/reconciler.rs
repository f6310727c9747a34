//! Reconciliation loop
//!
//! A single task owns the published bundle, the namespace registry and every
//! timer. It multiplexes shutdown, namespace events, refresh completions,
//! apply results and its timers with one `select!`, and never awaits anything
//! else: refreshes run in spawned tasks, apply rounds are fed to the executor
//! by a spawned producer, and both report back over channels.
//!
//! Convergence works in rounds. Every published bundle is stamped with a
//! publication time that only moves forward, and a namespace that received a
//! bundle records that bundle's stamp as its last success. A round takes every
//! namespace whose last success predates the current stamp, pushes every
//! artifact to each of them and folds the results back in. A namespace counts as converged only
//! when all of its artifacts were written. Once the last result of a round is
//! in, namespaces still pending are retried after the apply backoff, or after
//! the debounce delay if something new happened while the round was running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use certificator_bundle::{CertBundle, Digest};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use certificator_common::{Error, Observer, Outcome, Result};

use crate::apply::{produce_round, ApplyExecutor, ApplyOperation, ApplyResult, ApplySink};
use crate::artifact::{default_encoders, encode_all, ArtifactEncoder};
use crate::registry::{NamespaceRegistry, Upsert};
use crate::sources::{refresh_bundle, SourceLoader};
use crate::watch::{NamespaceEvent, NamespaceEventStream, NamespaceWatch};

/// Timing and sizing of the reconciliation loop
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Time limit for one bundle refresh
    pub download_timeout: Duration,
    /// Time between successful refreshes
    pub download_interval: Duration,
    /// Time before retrying a failed refresh
    pub download_retry_interval: Duration,
    /// Delay before retrying namespaces a round failed to converge
    pub apply_backoff: Duration,
    /// Time limit for one apply round
    pub apply_timeout: Duration,
    /// Delay before a round triggered by a namespace or bundle change
    pub apply_debounce: Duration,
    /// Bound on queued and running apply operations
    pub apply_queue_capacity: usize,
    /// Delay before re-establishing an ended namespace watch
    pub watch_restart_delay: Duration,
    /// Password protecting the JKS artifact
    pub jks_password: String,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            download_timeout: Duration::from_secs(5),
            download_interval: Duration::from_secs(24 * 60 * 60),
            download_retry_interval: Duration::from_secs(10 * 60),
            apply_backoff: Duration::from_secs(5 * 60),
            apply_timeout: Duration::from_secs(10),
            apply_debounce: Duration::from_secs(1),
            apply_queue_capacity: 1024,
            watch_restart_delay: Duration::from_secs(5),
            jks_password: "changeme".to_string(),
        }
    }
}

/// Keeps every known namespace supplied with the current bundle
pub struct Reconciler {
    settings: ReconcilerSettings,
    loader: Arc<dyn SourceLoader>,
    watch: Arc<dyn NamespaceWatch>,
    sink: Arc<dyn ApplySink>,
    observer: Arc<dyn Observer>,
    encoders: Vec<Arc<dyn ArtifactEncoder>>,
}

impl Reconciler {
    /// Create a reconciler producing the PEM and JKS artifacts
    pub fn new(
        settings: ReconcilerSettings,
        loader: Arc<dyn SourceLoader>,
        watch: Arc<dyn NamespaceWatch>,
        sink: Arc<dyn ApplySink>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            settings,
            loader,
            watch,
            sink,
            observer,
            encoders: default_encoders(),
        }
    }

    /// Replace the artifact encoders
    pub fn with_encoders(mut self, encoders: Vec<Arc<dyn ArtifactEncoder>>) -> Self {
        self.encoders = encoders;
        self
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Refresh, watch and apply failures are retried internally; the only
    /// error is an unusable configuration, reported before any work starts.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let capacity = self.settings.apply_queue_capacity;
        if capacity == 0 {
            return Err(Error::config_for_field(
                "apply_queue_capacity",
                "must be greater than zero",
            ));
        }

        let (refresh_tx, mut refresh_rx) = mpsc::channel(1);
        let (results_tx, mut results_rx) = mpsc::channel(capacity);
        let executor = ApplyExecutor::spawn(self.sink.clone(), capacity, results_tx.clone());

        let watch = self.watch.clone();
        let mut events: Option<NamespaceEventStream> = Some(watch.watch());

        let mut dispatcher = Dispatcher {
            settings: self.settings,
            loader: self.loader,
            observer: self.observer,
            encoders: self.encoders,
            shutdown: shutdown.clone(),
            refresh_tx,
            results_tx,
            work_tx: executor.sender(),
            registry: NamespaceRegistry::new(),
            published: None,
            refresh_at: Some(Instant::now()),
            apply_at: None,
            watch_restart_at: None,
            round: None,
            retrigger: false,
            next_round: 1,
        };

        info!("Reconciler started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping reconciler");
                    break;
                }

                Some(result) = results_rx.recv() => dispatcher.on_apply_result(result),

                Some(refreshed) = refresh_rx.recv() => dispatcher.on_refresh(refreshed),

                event = next_event(&mut events) => match event {
                    Some(Ok(event)) => dispatcher.on_namespace_event(event),
                    Some(Err(e)) => warn!(error = %e, "Namespace watch error"),
                    None => {
                        warn!(
                            delay = ?dispatcher.settings.watch_restart_delay,
                            "Namespace watch ended, restarting"
                        );
                        events = None;
                        dispatcher.watch_restart_at =
                            Some(Instant::now() + dispatcher.settings.watch_restart_delay);
                    }
                },

                _ = sleep_until_deadline(dispatcher.watch_restart_at) => {
                    dispatcher.watch_restart_at = None;
                    events = Some(watch.watch());
                }

                _ = sleep_until_deadline(dispatcher.refresh_at) => dispatcher.start_refresh(),

                _ = sleep_until_deadline(dispatcher.apply_at) => dispatcher.on_apply_timer(),
            }
        }

        // Results are no longer read; dropping the receiver lets pending
        // sends fail instead of holding executor permits.
        drop(events);
        drop(results_rx);
        drop(dispatcher);
        executor.shutdown().await;

        info!("Reconciler stopped");
        Ok(())
    }
}

async fn next_event(events: &mut Option<NamespaceEventStream>) -> Option<Result<NamespaceEvent>> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Per-namespace progress inside a round
#[derive(Debug)]
struct NamespaceProgress {
    remaining: usize,
    failed: bool,
}

/// The bundle handed out to namespaces
#[derive(Debug)]
struct Published {
    bundle: Arc<CertBundle>,
    digest: Digest,
    /// Strictly increasing across publications
    at: DateTime<Utc>,
}

/// The round currently in flight
#[derive(Debug)]
struct Round {
    id: u64,
    published_at: DateTime<Utc>,
    outstanding: usize,
    namespaces: HashMap<String, NamespaceProgress>,
}

/// State owned by the reconciler task
struct Dispatcher {
    settings: ReconcilerSettings,
    loader: Arc<dyn SourceLoader>,
    observer: Arc<dyn Observer>,
    encoders: Vec<Arc<dyn ArtifactEncoder>>,
    shutdown: CancellationToken,
    refresh_tx: mpsc::Sender<Result<(CertBundle, Digest)>>,
    results_tx: mpsc::Sender<ApplyResult>,
    work_tx: mpsc::Sender<ApplyOperation>,

    registry: NamespaceRegistry,
    published: Option<Published>,

    /// `None` while a refresh is running
    refresh_at: Option<Instant>,
    apply_at: Option<Instant>,
    watch_restart_at: Option<Instant>,

    round: Option<Round>,
    /// A namespace or bundle change arrived while a round was in flight
    retrigger: bool,
    next_round: u64,
}

impl Dispatcher {
    fn start_refresh(&mut self) {
        self.refresh_at = None;

        let loader = self.loader.clone();
        let password = self.settings.jks_password.clone();
        let timeout = self.settings.download_timeout;
        let cancel = self.shutdown.child_token();
        let tx = self.refresh_tx.clone();

        debug!(timeout = ?timeout, "Refreshing certificate bundle");
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = tokio::time::timeout(timeout, refresh_bundle(loader.as_ref(), &password)) => {
                    outcome.unwrap_or_else(|_| {
                        Err(Error::internal_with_context(
                            "refresh",
                            format!("download timeout of {timeout:?} exceeded"),
                        ))
                    })
                }
            };
            // The reconciler is gone once the channel is closed
            let _ = tx.send(outcome).await;
        });
    }

    fn on_refresh(&mut self, refreshed: Result<(CertBundle, Digest)>) {
        let (bundle, digest) = match refreshed {
            Ok(refreshed) => refreshed,
            Err(e) => {
                self.observer.record_refresh(Outcome::Failure);
                let retry = self.settings.download_retry_interval;
                error!(error = %e, retry_in = ?retry, "Failed to refresh certificate bundle");
                self.refresh_at = Some(Instant::now() + retry);
                return;
            }
        };

        self.observer.record_refresh(Outcome::Success);
        self.refresh_at = Some(Instant::now() + self.settings.download_interval);

        if self.published.as_ref().map(|p| p.digest) == Some(digest) {
            info!(digest = %digest, "Certificate bundle unchanged");
            return;
        }

        // Namespaces converged on the previous bundle hold its stamp, so the
        // new one must sort after it even if the clock did not move.
        let now = Utc::now();
        let at = match &self.published {
            Some(previous) if now <= previous.at => {
                previous.at + chrono::Duration::nanoseconds(1)
            }
            _ => now,
        };

        info!(
            digest = %digest,
            certificates = bundle.len(),
            next_refresh_in = ?self.settings.download_interval,
            "Certificate bundle updated"
        );
        self.observer.set_certificates(bundle.len());
        self.published = Some(Published {
            bundle: Arc::new(bundle),
            digest,
            at,
        });
        self.report_pending();
        self.request_round();
    }

    fn on_namespace_event(&mut self, event: NamespaceEvent) {
        match self.registry.upsert(&event) {
            Upsert::Inserted => {
                info!(namespace = %event.name, "Namespace added");
                self.request_round();
            }
            Upsert::Removed => info!(namespace = %event.name, "Namespace removed"),
            Upsert::Refreshed | Upsert::Ignored => {}
        }
        self.observer.set_namespaces(self.registry.len());
        self.report_pending();
    }

    /// Arm the apply timer at the debounce delay, or defer to the end of the
    /// running round
    fn request_round(&mut self) {
        if self.published.is_none() {
            return;
        }
        if self.round.is_some() {
            self.retrigger = true;
            return;
        }
        let at = Instant::now() + self.settings.apply_debounce;
        self.apply_at = Some(self.apply_at.map_or(at, |current| current.min(at)));
    }

    fn on_apply_timer(&mut self) {
        self.apply_at = None;
        if self.round.is_some() {
            self.retrigger = true;
            return;
        }
        self.start_round();
    }

    fn start_round(&mut self) {
        let Some((bundle, published_at)) = self
            .published
            .as_ref()
            .map(|p| (p.bundle.clone(), p.at))
        else {
            return;
        };

        let candidates: Vec<String> = self
            .registry
            .unsuccessful_since(published_at)
            .into_iter()
            .map(|target| target.name.clone())
            .collect();
        self.observer.set_pending_namespaces(candidates.len());

        if candidates.is_empty() {
            debug!("All namespaces have the current bundle");
            return;
        }

        let artifacts = match encode_all(&self.encoders, &bundle) {
            Ok(artifacts) if !artifacts.is_empty() => artifacts,
            Ok(_) => {
                warn!("No artifact encoders configured, nothing to distribute");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to encode certificate bundle");
                let now = Utc::now();
                for name in &candidates {
                    self.registry.record_result(name, false, now);
                }
                self.apply_at = Some(Instant::now() + self.settings.apply_backoff);
                return;
            }
        };

        let id = self.next_round;
        self.next_round += 1;
        let deadline = Instant::now() + self.settings.apply_timeout;
        let cancel = self.shutdown.child_token();

        let mut ops = Vec::with_capacity(candidates.len() * artifacts.len());
        let mut namespaces = HashMap::with_capacity(candidates.len());
        for name in &candidates {
            for artifact in &artifacts {
                ops.push(ApplyOperation {
                    round: id,
                    namespace: name.clone(),
                    artifact: artifact.clone(),
                    deadline,
                    cancel: cancel.clone(),
                });
            }
            namespaces.insert(
                name.clone(),
                NamespaceProgress {
                    remaining: artifacts.len(),
                    failed: false,
                },
            );
        }

        info!(
            round = id,
            namespaces = candidates.len(),
            operations = ops.len(),
            timeout = ?self.settings.apply_timeout,
            "Starting apply round"
        );

        self.round = Some(Round {
            id,
            published_at,
            outstanding: ops.len(),
            namespaces,
        });
        tokio::spawn(produce_round(
            ops,
            self.work_tx.clone(),
            cancel,
            self.results_tx.clone(),
        ));
    }

    fn on_apply_result(&mut self, result: ApplyResult) {
        self.observer
            .record_apply(Outcome::from_success(result.is_success()));
        match &result.outcome {
            Ok(()) => debug!(
                namespace = %result.namespace,
                configmap = %result.resource,
                "Applied ConfigMap"
            ),
            Err(e) => warn!(
                namespace = %result.namespace,
                configmap = %result.resource,
                error = %e,
                "Failed to apply ConfigMap"
            ),
        }

        let current = self.published.as_ref().map(|p| p.at);
        let Some(round) = self.round.as_mut() else {
            debug!(round = result.round, "Result without a running round");
            return;
        };
        if round.id != result.round {
            debug!(round = result.round, "Result from a finished round");
            return;
        }

        round.outstanding = round.outstanding.saturating_sub(1);
        if let Some(progress) = round.namespaces.get_mut(&result.namespace) {
            progress.remaining = progress.remaining.saturating_sub(1);
            progress.failed |= !result.is_success();

            if progress.remaining == 0 {
                if progress.failed {
                    self.registry
                        .record_result(&result.namespace, false, Utc::now());
                } else if current == Some(round.published_at) {
                    // Stamped with the bundle it received, not with the time
                    // the result arrived
                    if self
                        .registry
                        .record_result(&result.namespace, true, round.published_at)
                    {
                        debug!(namespace = %result.namespace, "Namespace has the current bundle");
                    }
                } else {
                    // Delivered a bundle that has since been replaced
                    debug!(namespace = %result.namespace, "Namespace received an outdated bundle");
                }
            }
        }

        if round.outstanding == 0 {
            self.finish_round();
        }
    }

    fn finish_round(&mut self) {
        let Some(round) = self.round.take() else {
            return;
        };
        let pending = self.report_pending();
        let retrigger = std::mem::take(&mut self.retrigger);

        if pending == 0 {
            info!(round = round.id, "All namespaces converged");
            return;
        }

        let delay = if retrigger {
            self.settings.apply_debounce
        } else {
            self.settings.apply_backoff
        };
        warn!(
            round = round.id,
            pending,
            retry_in = ?delay,
            "Namespaces still lack the current bundle"
        );
        self.apply_at = Some(Instant::now() + delay);
    }

    /// Publish the pending gauge and return its value
    fn report_pending(&self) -> usize {
        let pending = match &self.published {
            Some(published) => self.registry.pending_since(published.at),
            None => self.registry.len(),
        };
        self.observer.set_pending_namespaces(pending);
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::MockApplySink;
    use crate::sources::MockSourceLoader;
    use crate::testutil::bundle_with;
    use certificator_common::{NoopObserver, JKS_RESOURCE_NAME, PEM_RESOURCE_NAME};

    struct NoNamespaces;

    impl NamespaceWatch for NoNamespaces {
        fn watch(&self) -> NamespaceEventStream {
            futures::stream::pending().boxed()
        }
    }

    fn reconciler(settings: ReconcilerSettings, loader: MockSourceLoader) -> Reconciler {
        Reconciler::new(
            settings,
            Arc::new(loader),
            Arc::new(NoNamespaces),
            Arc::new(MockApplySink::new()),
            Arc::new(NoopObserver),
        )
    }

    /// Receivers kept alive for the dispatcher's senders
    struct Channels {
        _refresh_rx: mpsc::Receiver<Result<(CertBundle, Digest)>>,
        _results_rx: mpsc::Receiver<ApplyResult>,
        _work_rx: mpsc::Receiver<ApplyOperation>,
    }

    fn dispatcher() -> (Dispatcher, Channels) {
        let (refresh_tx, _refresh_rx) = mpsc::channel(1);
        let (results_tx, _results_rx) = mpsc::channel(16);
        let (work_tx, _work_rx) = mpsc::channel(16);
        let dispatcher = Dispatcher {
            settings: ReconcilerSettings::default(),
            loader: Arc::new(MockSourceLoader::new()),
            observer: Arc::new(NoopObserver),
            encoders: default_encoders(),
            shutdown: CancellationToken::new(),
            refresh_tx,
            results_tx,
            work_tx,
            registry: NamespaceRegistry::new(),
            published: None,
            refresh_at: None,
            apply_at: None,
            watch_restart_at: None,
            round: None,
            retrigger: false,
            next_round: 1,
        };
        let channels = Channels {
            _refresh_rx,
            _results_rx,
            _work_rx,
        };
        (dispatcher, channels)
    }

    fn publish(dispatcher: &mut Dispatcher, bundle: CertBundle) {
        let digest = bundle.digest();
        dispatcher.on_refresh(Ok((bundle, digest)));
    }

    /// Start a round and return its id
    fn start(dispatcher: &mut Dispatcher) -> u64 {
        dispatcher.on_apply_timer();
        dispatcher.round.as_ref().map(|round| round.id).unwrap()
    }

    fn deliver(dispatcher: &mut Dispatcher, round: u64, namespace: &str) {
        for resource in [PEM_RESOURCE_NAME, JKS_RESOURCE_NAME] {
            dispatcher.on_apply_result(ApplyResult {
                round,
                namespace: namespace.to_string(),
                resource: resource.to_string(),
                outcome: Ok(()),
            });
        }
    }

    #[tokio::test]
    async fn test_result_folded_before_newer_bundle_is_published() {
        let (mut d, _channels) = dispatcher();
        d.on_namespace_event(NamespaceEvent::observed("team-a", Utc::now()));
        publish(&mut d, bundle_with(&["Root A"]));
        let round = start(&mut d);

        // A refresh builds the next bundle while the round's results are
        // still queued; they are folded before the bundle is published.
        let newer = bundle_with(&["Root A", "Root B"]);
        tokio::time::sleep(Duration::from_millis(5)).await;
        deliver(&mut d, round, "team-a");
        assert!(d.round.is_none());
        assert_eq!(d.report_pending(), 0);

        publish(&mut d, newer);
        assert_eq!(d.report_pending(), 1);
        assert!(d.apply_at.is_some());
    }

    #[tokio::test]
    async fn test_empty_bundle_reaches_converged_namespaces() {
        let (mut d, _channels) = dispatcher();
        d.on_namespace_event(NamespaceEvent::observed("team-a", Utc::now()));
        publish(&mut d, bundle_with(&["Root A"]));
        let round = start(&mut d);
        deliver(&mut d, round, "team-a");
        assert_eq!(d.report_pending(), 0);

        // Never appended to, so its own change time is the epoch
        publish(&mut d, CertBundle::new("changeme"));
        assert_eq!(d.report_pending(), 1);
        let candidates = d
            .registry
            .unsuccessful_since(d.published.as_ref().unwrap().at);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "team-a");
    }

    #[tokio::test]
    async fn test_round_for_replaced_bundle_does_not_converge() {
        let (mut d, _channels) = dispatcher();
        d.on_namespace_event(NamespaceEvent::observed("team-a", Utc::now()));
        publish(&mut d, bundle_with(&["Root A"]));
        let round = start(&mut d);

        publish(&mut d, bundle_with(&["Root B"]));
        assert!(d.retrigger);

        deliver(&mut d, round, "team-a");
        assert!(d.round.is_none());
        assert_eq!(d.registry.get("team-a").unwrap().last_success, None);
        assert_eq!(d.report_pending(), 1);

        // Retried after the debounce delay rather than the backoff
        let retry_at = d.apply_at.unwrap();
        assert!(retry_at <= Instant::now() + d.settings.apply_debounce);
        assert!(!d.retrigger);
    }

    #[test]
    fn test_publication_stamps_move_forward() {
        let (mut d, _channels) = dispatcher();
        publish(&mut d, bundle_with(&["Root A"]));
        let first = d.published.as_ref().unwrap().at;
        publish(&mut d, bundle_with(&["Root B"]));
        let second = d.published.as_ref().unwrap().at;
        assert!(second > first);

        // Same content keeps the stamp
        let digest = d.published.as_ref().unwrap().digest;
        let same = d.published.as_ref().unwrap().bundle.as_ref().clone();
        d.on_refresh(Ok((same, digest)));
        assert_eq!(d.published.as_ref().unwrap().at, second);
    }

    #[test]
    fn test_default_settings() {
        let settings = ReconcilerSettings::default();
        assert_eq!(settings.download_timeout, Duration::from_secs(5));
        assert_eq!(settings.download_interval, Duration::from_secs(86_400));
        assert_eq!(settings.download_retry_interval, Duration::from_secs(600));
        assert_eq!(settings.apply_backoff, Duration::from_secs(300));
        assert_eq!(settings.apply_timeout, Duration::from_secs(10));
        assert_eq!(settings.apply_queue_capacity, 1024);
        assert_eq!(settings.jks_password, "changeme");
    }

    #[tokio::test]
    async fn test_zero_capacity_is_rejected_before_start() {
        let mut loader = MockSourceLoader::new();
        loader.expect_load().never();
        let settings = ReconcilerSettings {
            apply_queue_capacity: 0,
            ..Default::default()
        };

        let err = reconciler(settings, loader)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let mut loader = MockSourceLoader::new();
        loader.expect_load().returning(|| Ok(vec![]));

        let shutdown = CancellationToken::new();
        let reconciler = reconciler(ReconcilerSettings::default(), loader);
        let handle = tokio::spawn(reconciler.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reconciler stops in time")
            .unwrap();
        assert!(result.is_ok());
    }
}
