use super::dispatch::AttackRecord;
use super::rules::{AttackKind, RuleSet};
use super::state::AttackerTracker;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Longest evidence excerpt carried in an alert body.
const EVIDENCE_MAX: usize = 512;

/// Line classification pipeline shared by every tail worker.
///
/// Per line: extract the source address (or drop the line untouched),
/// update the sliding windows, classify in priority order, then either
/// queue one AttackRecord or log the suppression. At most one record per
/// line leaves the engine.
pub struct DetectionEngine {
    rules: RuleSet,
    tracker: Arc<AttackerTracker>,
    tx: mpsc::Sender<AttackRecord>,
}

impl DetectionEngine {
    pub fn new(rules: RuleSet, tracker: Arc<AttackerTracker>, tx: mpsc::Sender<AttackRecord>) -> Self {
        Self { rules, tracker, tx }
    }

    pub fn tracker(&self) -> &Arc<AttackerTracker> {
        &self.tracker
    }

    pub async fn process_line(&self, pod_name: &str, raw: &str) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }
        metrics::counter!("mirage_log_lines_total").increment(1);

        let Some(source_ip) = self.rules.extract_source_ip(line) else {
            return;
        };

        let is_auth = self.rules.is_auth_failure(line);
        let outcome = self
            .tracker
            .record_line(&source_ip, is_auth, Instant::now())
            .await;

        let kind = if self.rules.is_sqli(line) {
            Some(AttackKind::Sqli)
        } else if self.rules.is_path_traversal(line) {
            Some(AttackKind::PathTraversal)
        } else if outcome.auth_breached {
            Some(AttackKind::AuthBruteforce)
        } else if outcome.rate_breached {
            Some(AttackKind::RateAbuse)
        } else {
            None
        };

        let Some(kind) = kind else {
            return;
        };

        metrics::counter!("mirage_detections_total", "attack_type" => kind.as_str()).increment(1);

        if self.tracker.in_cooldown(&source_ip, Instant::now()).await {
            metrics::counter!("mirage_alerts_suppressed_total").increment(1);
            info!(
                action = "alert_suppressed",
                attack_type = kind.as_str(),
                source_ip = %source_ip,
                pod = %pod_name,
                "detection inside cooldown window"
            );
            return;
        }

        let mut evidence = line.to_string();
        if evidence.len() > EVIDENCE_MAX {
            let mut cut = EVIDENCE_MAX;
            while !evidence.is_char_boundary(cut) {
                cut -= 1;
            }
            evidence.truncate(cut);
        }

        let record = AttackRecord {
            timestamp: Utc::now(),
            attack_type: kind.as_str().to_string(),
            source_ip: source_ip.clone(),
            evidence,
            severity: kind.severity().to_string(),
            pod_name: pod_name.to_string(),
        };

        info!(
            action = "attack_detected",
            attack_type = kind.as_str(),
            source_ip = %source_ip,
            severity = kind.severity(),
            pod = %pod_name,
            "queueing alert"
        );

        if self.tx.send(record).await.is_err() {
            warn!(action = "dispatch_channel_closed", "dropping detection");
        }
    }
}
