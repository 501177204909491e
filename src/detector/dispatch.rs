use super::state::AttackerTracker;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The detector → controller wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackRecord {
    pub timestamp: DateTime<Utc>,
    pub attack_type: String,
    pub source_ip: String,
    pub evidence: String,
    pub severity: String,
    pub pod_name: String,
}

/// Sends AttackRecords to the controller alert sink.
///
/// Delivery advances the sender's cooldown only on a 2xx — a failed POST
/// leaves `last_alert_at` untouched so the next qualifying breach retries.
pub struct AlertDispatcher {
    client: reqwest::Client,
    endpoint: String,
}

pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

impl AlertDispatcher {
    pub fn new(controller_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DISPATCH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/alerts", controller_url.trim_end_matches('/')),
        })
    }

    pub async fn send(&self, record: &AttackRecord) -> Result<()> {
        let resp = self.client.post(&self.endpoint).json(record).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("alert sink returned {}", status);
        }
        Ok(())
    }
}

/// The single dispatcher task: drains the detection channel, posts each
/// record, and advances the per-address cooldown on success.
pub async fn run_dispatcher(
    mut rx: mpsc::Receiver<AttackRecord>,
    dispatcher: AlertDispatcher,
    tracker: Arc<AttackerTracker>,
) {
    while let Some(record) = rx.recv().await {
        match dispatcher.send(&record).await {
            Ok(()) => {
                tracker.mark_alerted(&record.source_ip, Instant::now()).await;
                metrics::counter!("mirage_alerts_sent_total").increment(1);
                info!(
                    action = "alert_sent",
                    attack_type = %record.attack_type,
                    source_ip = %record.source_ip,
                    severity = %record.severity,
                    pod = %record.pod_name,
                    "alert delivered"
                );
            }
            Err(e) => {
                // cooldown not advanced: the next breach retries
                warn!(
                    action = "alert_failed",
                    attack_type = %record.attack_type,
                    source_ip = %record.source_ip,
                    error = %e,
                    "alert delivery failed"
                );
            }
        }
    }
}
