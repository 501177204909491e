use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for all three mirage components.
///
/// A single file configures the whole system; each binary subcommand reads
/// only its own section. Durations are humantime strings ("90s", "1m", "5m").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirageConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

/// Routing gateway: the ingress proxy holding the block table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Listen port for both proxied traffic and the control API.
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Base URL of the protected upstream service.
    #[serde(default = "default_legitimate_url")]
    pub legitimate_service_url: String,
    /// Timeout applied to each proxied upstream/decoy request.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: String,
}

/// Log-stream detector: pod discovery, tailing, and classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
    /// Base URL of the controller's alert sink.
    #[serde(default = "default_controller_url")]
    pub controller_url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Label selector for the pods to tail, e.g. "app=shop".
    #[serde(default = "default_watch_labels")]
    pub watch_labels: String,
    #[serde(default = "default_rate_threshold")]
    pub rate_limit_threshold: u64,
    #[serde(default = "default_one_minute")]
    pub rate_limit_window: String,
    #[serde(default = "default_auth_limit")]
    pub auth_failure_limit: u64,
    #[serde(default = "default_one_minute")]
    pub auth_failure_window: String,
    /// Minimum interval between alerts for the same source address.
    #[serde(default = "default_cooldown")]
    pub cooldown_period: String,
}

/// Decoy orchestrator: reconciler, alert sink, gateway programming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Base URL of the gateway's control API.
    #[serde(default = "default_manager_url")]
    pub manager_url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Listen port for the alert sink and observer stream.
    #[serde(default = "default_sink_port")]
    pub sink_port: u16,
    /// Image the decoy pods run; defaults to the protected upstream's image
    /// so mirror decoys are behaviorally indistinguishable.
    #[serde(default = "default_decoy_image")]
    pub decoy_image: String,
    /// Container port the decoys listen on.
    #[serde(default = "default_decoy_port")]
    pub decoy_port: u16,
    /// Label (key=value) identifying gateway pods for isolation ingress.
    #[serde(default = "default_gateway_label")]
    pub gateway_label: String,
    /// Label (key=value) identifying the metrics sink for isolation egress.
    #[serde(default = "default_metrics_label")]
    pub metrics_sink_label: String,
    /// Decoy fleet lifetime in minutes.
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: i64,
    /// Services named in created AttackResponses.
    #[serde(default = "default_protected_services")]
    pub protected_services: Vec<String>,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_legitimate_url() -> String {
    "http://shop-service.default.svc.cluster.local:8080".to_string()
}

fn default_upstream_timeout() -> String {
    "2s".to_string()
}

fn default_controller_url() -> String {
    "http://mirage-controller.default.svc.cluster.local:8081".to_string()
}

fn default_manager_url() -> String {
    "http://mirage-gateway.default.svc.cluster.local:8080".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_watch_labels() -> String {
    "app=shop".to_string()
}

fn default_rate_threshold() -> u64 {
    50
}

fn default_auth_limit() -> u64 {
    3
}

fn default_one_minute() -> String {
    "1m".to_string()
}

fn default_cooldown() -> String {
    "5m".to_string()
}

fn default_sink_port() -> u16 {
    8081
}

fn default_decoy_image() -> String {
    "shop-service:latest".to_string()
}

fn default_decoy_port() -> u16 {
    8080
}

fn default_gateway_label() -> String {
    "app=mirage-gateway".to_string()
}

fn default_metrics_label() -> String {
    "app=metrics-sink".to_string()
}

fn default_ttl_minutes() -> i64 {
    15
}

fn default_protected_services() -> Vec<String> {
    vec!["shop-service".to_string()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            legitimate_service_url: default_legitimate_url(),
            upstream_timeout: default_upstream_timeout(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            controller_url: default_controller_url(),
            namespace: default_namespace(),
            watch_labels: default_watch_labels(),
            rate_limit_threshold: default_rate_threshold(),
            rate_limit_window: default_one_minute(),
            auth_failure_limit: default_auth_limit(),
            auth_failure_window: default_one_minute(),
            cooldown_period: default_cooldown(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            manager_url: default_manager_url(),
            namespace: default_namespace(),
            sink_port: default_sink_port(),
            decoy_image: default_decoy_image(),
            decoy_port: default_decoy_port(),
            gateway_label: default_gateway_label(),
            metrics_sink_label: default_metrics_label(),
            ttl_minutes: default_ttl_minutes(),
            protected_services: default_protected_services(),
        }
    }
}

impl GatewayConfig {
    pub fn upstream_timeout(&self) -> anyhow::Result<Duration> {
        parse_duration("gateway.upstream_timeout", &self.upstream_timeout)
    }
}

impl DetectorConfig {
    pub fn rate_limit_window(&self) -> anyhow::Result<Duration> {
        parse_duration("detector.rate_limit_window", &self.rate_limit_window)
    }

    pub fn auth_failure_window(&self) -> anyhow::Result<Duration> {
        parse_duration("detector.auth_failure_window", &self.auth_failure_window)
    }

    pub fn cooldown_period(&self) -> anyhow::Result<Duration> {
        parse_duration("detector.cooldown_period", &self.cooldown_period)
    }
}

pub(crate) fn parse_duration(field: &str, value: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| anyhow::anyhow!("{}: invalid duration '{}': {}", field, value, e))
}
