use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Build the Prometheus recorder and try to install it globally.
    ///
    /// If a recorder is already installed (a second component started in the
    /// same process, e.g. under test) the new handle still renders its own
    /// registry; macro-recorded values keep flowing to the first recorder.
    pub fn install() -> Self {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .build_recorder();
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("metrics: global recorder already installed, reusing");
            return Self { handle };
        }

        // request path
        describe_counter!(
            "mirage_http_requests_total",
            Unit::Count,
            "Total HTTP requests handled by the gateway"
        );
        describe_histogram!(
            "mirage_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_gauge!(
            "mirage_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_gauge!(
            "mirage_blocked_ips",
            Unit::Count,
            "Source addresses currently routed to decoy fleets"
        );
        describe_counter!(
            "mirage_decoy_routed_total",
            Unit::Count,
            "Requests fanned out to decoys"
        );

        // detection
        describe_counter!(
            "mirage_log_lines_total",
            Unit::Count,
            "Log lines consumed from tailed pods"
        );
        describe_counter!(
            "mirage_detections_total",
            Unit::Count,
            "Attack detections by type (before cooldown)"
        );
        describe_counter!(
            "mirage_alerts_sent_total",
            Unit::Count,
            "Alerts successfully delivered to the controller"
        );
        describe_counter!(
            "mirage_alerts_suppressed_total",
            Unit::Count,
            "Detections suppressed by per-address cooldown"
        );
        describe_gauge!(
            "mirage_tail_workers_active",
            Unit::Count,
            "Pod log tail workers currently running"
        );

        // orchestration
        describe_counter!(
            "mirage_alerts_received_total",
            Unit::Count,
            "Alert bodies accepted by the sink"
        );
        describe_counter!(
            "mirage_reconcile_total",
            Unit::Count,
            "AttackResponse reconcile cycles"
        );
        describe_counter!(
            "mirage_reconcile_errors_total",
            Unit::Count,
            "AttackResponse reconcile errors"
        );
        describe_counter!(
            "mirage_decoys_created_total",
            Unit::Count,
            "Decoy pods created, labeled by variant"
        );
        describe_counter!(
            "mirage_responses_expired_total",
            Unit::Count,
            "AttackResponses torn down by TTL"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
