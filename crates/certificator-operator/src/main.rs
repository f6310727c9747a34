//! Certificator - CA bundle distribution for Kubernetes namespaces

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use certificator_common::telemetry::{init_telemetry, TelemetryConfig};
use certificator_common::Metrics;
use certificator_operator::apply::KubeConfigMapSink;
use certificator_operator::config::Config;
use certificator_operator::reconciler::Reconciler;
use certificator_operator::sources::CertificateSources;
use certificator_operator::watch::KubeNamespaceWatch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = Config::parse();

    init_telemetry(TelemetryConfig {
        service_name: "certificator".to_string(),
        log_format: config.log_format,
        log_level: config.log_level.clone(),
        otlp_endpoint: config.otlp_endpoint.clone(),
    })?;

    info!(version = env!("CARGO_PKG_VERSION"), "Certificator starting");
    for url in &config.ca_urls {
        info!(url = %url, "CA certificate source");
    }
    for directory in &config.ca_directories {
        info!(directory = %directory.display(), "CA certificate source");
    }

    config.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let sources = CertificateSources::new(config.ca_directories.clone(), config.ca_urls.clone())?;
    let watch = KubeNamespaceWatch::new(client.clone(), config.namespace_label_selector.clone());
    let sink = KubeConfigMapSink::new(client);

    let reconciler = Reconciler::new(
        config.reconciler_settings(),
        Arc::new(sources),
        Arc::new(watch),
        Arc::new(sink),
        Arc::new(Metrics::global()),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    reconciler.run(shutdown).await?;

    info!("Certificator stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn cancel_on_signal(shutdown: CancellationToken) {
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                None
            }
        };

    let sigterm = async {
        match terminate.as_mut() {
            Some(signal) => {
                signal.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for SIGINT");
                return;
            }
            info!("Received SIGINT");
        }
        _ = sigterm => info!("Received SIGTERM"),
    }

    shutdown.cancel();
}
