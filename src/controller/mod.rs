pub mod crd;
pub mod decoys;
pub mod events;
pub mod manager;
pub mod reconcile;
pub mod sink;

pub use crd::{AttackResponse, AttackResponseSpec, AttackResponseStatus, Phase};
pub use events::{EventBus, EventKind};
pub use manager::ManagerClient;

use crate::config::ControllerConfig;
use crate::metrics::Metrics;
use anyhow::{Context, Result};
use dashmap::DashMap;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Controller;
use kube::runtime::watcher;
use kube::{Api, Client, CustomResourceExt};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Render the AttackResponse CRD manifest, for `mirage crd | kubectl apply -f -`.
pub fn crd_manifest() -> Result<String> {
    Ok(serde_json::to_string_pretty(&AttackResponse::crd())?)
}

/// Controller lifecycle: connect, start the alert sink, then reconcile
/// AttackResponses until shutdown.
pub async fn run(cfg: &ControllerConfig, metrics: Metrics, shutdown: Arc<Notify>) -> Result<()> {
    let client = Client::try_default()
        .await
        .context("connecting to the cluster api")?;

    let bus = EventBus::new();
    let manager = ManagerClient::new(&cfg.manager_url)
        .map_err(|e| anyhow::anyhow!("building manager client: {}", e))?;

    let sink_state = sink::SinkState {
        client: client.clone(),
        cfg: Arc::new(cfg.clone()),
        bus: bus.clone(),
        metrics,
    };
    let sink_shutdown = shutdown.clone();
    let sink_handle = tokio::spawn(async move {
        if let Err(e) = sink::run(sink_state, sink_shutdown).await {
            warn!(action = "sink_failed", error = %e, "alert sink exited");
        }
    });

    let responses: Api<AttackResponse> = Api::namespaced(client.clone(), &cfg.namespace);
    let pods: Api<Pod> = Api::namespaced(client.clone(), &cfg.namespace);

    let ctx = Arc::new(reconcile::Ctx {
        client,
        cfg: cfg.clone(),
        manager,
        bus,
        failures: DashMap::new(),
    });

    info!(
        action = "controller_started",
        namespace = %cfg.namespace,
        manager = %cfg.manager_url,
        "reconciling attack responses"
    );

    let controller = Controller::new(responses, watcher::Config::default())
        .owns(pods, watcher::Config::default())
        .run(reconcile::reconcile, reconcile::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!(action = "reconciled", response = %obj.name, "reconcile ok");
                }
                Err(e) => {
                    warn!(action = "reconcile_dispatch_error", error = %e, "controller error");
                }
            }
        });

    tokio::select! {
        _ = controller => {
            warn!(action = "controller_stream_ended", "controller stream ended unexpectedly");
        }
        _ = shutdown.notified() => {
            info!(action = "controller_stopping", "shutdown signal received");
        }
    }

    sink_handle.abort();
    info!(action = "controller_stopped", "shutdown complete");
    Ok(())
}
