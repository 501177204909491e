pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl MirageConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — every component can start with zero configuration and be
    /// steered entirely through its environment, which is how the in-cluster
    /// manifests drive it.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: MirageConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            MirageConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides, names per the deployment contract.
    /// `NAMESPACE` applies to both the detector and the controller — they are
    /// deployed in the namespace they operate on.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(p) = v.parse::<u16>() {
                self.gateway.port = p;
            }
        }
        if let Ok(v) = std::env::var("LEGITIMATE_SERVICE_URL") {
            self.gateway.legitimate_service_url = v;
        }
        if let Ok(v) = std::env::var("UPSTREAM_TIMEOUT") {
            self.gateway.upstream_timeout = v;
        }

        if let Ok(v) = std::env::var("CONTROLLER_URL") {
            self.detector.controller_url = v;
        }
        if let Ok(v) = std::env::var("NAMESPACE") {
            self.detector.namespace = v.clone();
            self.controller.namespace = v;
        }
        if let Ok(v) = std::env::var("WATCH_LABELS") {
            self.detector.watch_labels = v;
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_THRESHOLD") {
            if let Ok(n) = v.parse::<u64>() {
                self.detector.rate_limit_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_WINDOW") {
            self.detector.rate_limit_window = v;
        }
        if let Ok(v) = std::env::var("AUTH_FAILURE_LIMIT") {
            if let Ok(n) = v.parse::<u64>() {
                self.detector.auth_failure_limit = n;
            }
        }
        if let Ok(v) = std::env::var("AUTH_FAILURE_WINDOW") {
            self.detector.auth_failure_window = v;
        }
        if let Ok(v) = std::env::var("COOLDOWN_PERIOD") {
            self.detector.cooldown_period = v;
        }

        if let Ok(v) = std::env::var("MANAGER_URL") {
            self.controller.manager_url = v;
        }
        if let Ok(v) = std::env::var("SINK_PORT") {
            if let Ok(p) = v.parse::<u16>() {
                self.controller.sink_port = p;
            }
        }
        if let Ok(v) = std::env::var("DECOY_IMAGE") {
            self.controller.decoy_image = v;
        }
        if let Ok(v) = std::env::var("DECOY_PORT") {
            if let Ok(p) = v.parse::<u16>() {
                self.controller.decoy_port = p;
            }
        }
        if let Ok(v) = std::env::var("AUTO_CLEANUP_MINUTES") {
            if let Ok(n) = v.parse::<i64>() {
                self.controller.ttl_minutes = n;
            }
        }
    }

    /// Fail fast on configuration that would only surface mid-flight.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            anyhow::bail!("gateway.port must be non-zero");
        }
        if self.controller.sink_port == 0 {
            anyhow::bail!("controller.sink_port must be non-zero");
        }
        for (field, url) in [
            ("gateway.legitimate_service_url", &self.gateway.legitimate_service_url),
            ("detector.controller_url", &self.detector.controller_url),
            ("controller.manager_url", &self.controller.manager_url),
        ] {
            let parsed: http::Uri = url
                .parse()
                .map_err(|e| anyhow::anyhow!("{}: invalid URL '{}': {}", field, url, e))?;
            if parsed.scheme().is_none() || parsed.authority().is_none() {
                anyhow::bail!("{}: URL '{}' must carry scheme and host", field, url);
            }
        }
        self.gateway.upstream_timeout()?;
        self.detector.rate_limit_window()?;
        self.detector.auth_failure_window()?;
        self.detector.cooldown_period()?;
        if self.detector.rate_limit_threshold == 0 || self.detector.auth_failure_limit == 0 {
            anyhow::bail!("detector thresholds must be at least 1");
        }
        if self.detector.watch_labels.trim().is_empty() {
            anyhow::bail!("detector.watch_labels must not be empty");
        }
        for (field, label) in [
            ("controller.gateway_label", &self.controller.gateway_label),
            ("controller.metrics_sink_label", &self.controller.metrics_sink_label),
        ] {
            if label.split_once('=').map_or(true, |(k, v)| k.is_empty() || v.is_empty()) {
                anyhow::bail!("{}: '{}' must be key=value", field, label);
            }
        }
        if self.controller.ttl_minutes <= 0 {
            anyhow::bail!("controller.ttl_minutes must be positive");
        }
        Ok(())
    }
}
