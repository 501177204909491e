use super::engine::DetectionEngine;
use futures_util::io::AsyncBufReadExt;
use futures_util::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::LogParams;
use kube::Api;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Follow one pod's stdout until the stream ends, the pod goes away, or the
/// worker is cancelled. Stream errors end the worker only — the informer
/// starts a fresh one on the pod's next event.
pub async fn run_tail(
    pods: Api<Pod>,
    pod_name: String,
    engine: Arc<DetectionEngine>,
    cancel: CancellationToken,
) {
    let params = LogParams {
        follow: true,
        tail_lines: Some(10),
        ..Default::default()
    };

    let stream = match pods.log_stream(&pod_name, &params).await {
        Ok(s) => s,
        Err(e) => {
            warn!(action = "tail_open_failed", pod = %pod_name, error = %e, "cannot open log stream");
            return;
        }
    };

    info!(action = "tail_started", pod = %pod_name, "following pod logs");
    metrics::gauge!("mirage_tail_workers_active").increment(1.0);

    let mut lines = stream.lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(action = "tail_cancelled", pod = %pod_name, "worker cancelled");
                break;
            }
            next = lines.try_next() => {
                match next {
                    Ok(Some(line)) => engine.process_line(&pod_name, &line).await,
                    Ok(None) => {
                        info!(action = "tail_ended", pod = %pod_name, "log stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(action = "tail_read_error", pod = %pod_name, error = %e, "log stream error");
                        break;
                    }
                }
            }
        }
    }

    metrics::gauge!("mirage_tail_workers_active").decrement(1.0);
}
