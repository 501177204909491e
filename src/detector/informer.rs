use super::engine::DetectionEngine;
use super::tail;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Watch pods matching the label selector and keep exactly one tail worker
/// per running pod.
///
/// The watcher's built-in backoff handles reconnects; the registry below is
/// the informer cache that stops the same pod from being tailed twice. A
/// worker that finished (stream end, error) is replaced on the pod's next
/// event, which is how tailing resumes.
pub async fn run_informer(
    pods: Api<Pod>,
    label_selector: String,
    engine: Arc<DetectionEngine>,
    shutdown: Arc<Notify>,
) {
    let wc = watcher::Config::default().labels(&label_selector);
    let mut stream = watcher(pods.clone(), wc).default_backoff().boxed();

    let mut workers: HashMap<String, Worker> = HashMap::new();

    loop {
        let event = tokio::select! {
            ev = stream.next() => ev,
            _ = shutdown.notified() => {
                info!(action = "informer_stopping", "cancelling tail workers");
                break;
            }
        };

        let Some(event) = event else {
            warn!(action = "informer_stream_ended", "pod watch stream ended");
            break;
        };

        match event {
            Ok(watcher::Event::Apply(pod)) | Ok(watcher::Event::InitApply(pod)) => {
                sync_pod(&pods, &pod, &engine, &mut workers);
            }
            Ok(watcher::Event::Delete(pod)) => {
                let name = pod.name_any();
                if let Some(worker) = workers.remove(&name) {
                    worker.cancel.cancel();
                    info!(action = "tail_stopped", pod = %name, "pod deleted");
                }
            }
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {}
            Err(e) => {
                warn!(action = "informer_error", error = %e, "pod watch error, backing off");
            }
        }
    }

    for (name, worker) in workers {
        worker.cancel.cancel();
        info!(action = "tail_stopped", pod = %name, "shutdown");
    }
}

fn sync_pod(
    pods: &Api<Pod>,
    pod: &Pod,
    engine: &Arc<DetectionEngine>,
    workers: &mut HashMap<String, Worker>,
) {
    let name = pod.name_any();

    let running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Running");
    if !running {
        return;
    }

    if let Some(existing) = workers.get(&name) {
        if !existing.handle.is_finished() {
            return; // already tailing
        }
        workers.remove(&name);
    }

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(tail::run_tail(
        pods.clone(),
        name.clone(),
        engine.clone(),
        cancel.clone(),
    ));
    workers.insert(name, Worker { cancel, handle });
}
