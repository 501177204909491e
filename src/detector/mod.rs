pub mod dispatch;
pub mod engine;
mod informer;
pub mod rules;
pub mod state;
mod tail;

pub use dispatch::{AlertDispatcher, AttackRecord};
pub use engine::DetectionEngine;
pub use rules::{AttackKind, RuleSet};
pub use state::{AttackerTracker, Thresholds};

use crate::config::DetectorConfig;
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::info;

/// Capacity of the detection → dispatcher channel. Detections are rare
/// relative to log volume; a small buffer absorbs bursts while the
/// dispatcher is mid-POST.
const DISPATCH_QUEUE: usize = 256;

/// Detector lifecycle: compile rules (fatal on failure), connect to the
/// cluster, then run the informer and the dispatcher until shutdown.
pub async fn run(cfg: &DetectorConfig, shutdown: Arc<Notify>) -> Result<()> {
    let rules = RuleSet::new().context("compiling detection rules")?;

    let thresholds = Thresholds {
        rate_limit: cfg.rate_limit_threshold,
        rate_window: cfg.rate_limit_window()?,
        auth_limit: cfg.auth_failure_limit,
        auth_window: cfg.auth_failure_window()?,
        cooldown: cfg.cooldown_period()?,
    };
    let tracker = Arc::new(AttackerTracker::new(thresholds));
    tracker.start_gc();

    let (tx, rx) = mpsc::channel(DISPATCH_QUEUE);
    let engine = Arc::new(DetectionEngine::new(rules, tracker.clone(), tx));

    let dispatcher = AlertDispatcher::new(&cfg.controller_url)?;
    let dispatcher_handle = tokio::spawn(dispatch::run_dispatcher(rx, dispatcher, tracker));

    let client = kube::Client::try_default()
        .await
        .context("connecting to the cluster api")?;
    let pods: Api<Pod> = Api::namespaced(client, &cfg.namespace);

    info!(
        action = "detector_started",
        namespace = %cfg.namespace,
        labels = %cfg.watch_labels,
        controller = %cfg.controller_url,
        "watching pods"
    );

    informer::run_informer(pods, cfg.watch_labels.clone(), engine, shutdown).await;

    // informer returned: the engine (and its channel sender) is gone, so the
    // dispatcher drains the queue and exits.
    dispatcher_handle.await.ok();
    info!(action = "detector_stopped", "shutdown complete");
    Ok(())
}
