use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster-persisted intent: "route attacker `sourceIP` to a decoy fleet
/// until `cleanupScheduledAt`".
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "deception.mirage.dev",
    version = "v1",
    kind = "AttackResponse",
    namespaced,
    status = "AttackResponseStatus",
    shortname = "atkr",
    printcolumn = r#"{"name":"Source", "type":"string", "jsonPath":".spec.sourceIP"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Cleanup", "type":"string", "jsonPath":".status.cleanupScheduledAt"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AttackResponseSpec {
    /// Services the attacker was probing; informational.
    pub services: Vec<String>,
    #[serde(default = "default_decoy_count")]
    pub decoy_count: i32,
    #[serde(default = "default_cleanup_minutes")]
    pub auto_cleanup_minutes: i64,
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    pub attack_type: String,
    pub severity: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttackResponseStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub decoy_pods: Vec<String>,
    #[serde(rename = "decoyURLs", default)]
    pub decoy_urls: Vec<String>,
    /// RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// RFC 3339; `createdAt + autoCleanupMinutes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_scheduled_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_decoy_count() -> i32 {
    3
}

fn default_cleanup_minutes() -> i64 {
    15
}

/// `Pending → Creating → Active → (deleted at TTL)`; `Creating → Failed` on
/// an irrecoverable create error; `Failed` also waits for the TTL. There is
/// no path from Active back to Pending.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Creating,
    Active,
    Failed,
    TerminatingByTTL,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Creating => "Creating",
            Phase::Active => "Active",
            Phase::Failed => "Failed",
            Phase::TerminatingByTTL => "TerminatingByTTL",
        };
        f.write_str(s)
    }
}

impl AttackResponseStatus {
    pub fn cleanup_due(&self) -> Option<DateTime<Utc>> {
        self.cleanup_scheduled_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.cleanup_due().is_some_and(|due| now >= due)
    }
}

/// Unique, RFC 1123-safe resource name derived from the source address and
/// the alert arrival time.
pub fn response_name(source_ip: &str, at: DateTime<Utc>) -> String {
    format!("attack-response-{}-{}", sanitize_dns(source_ip), at.timestamp_millis())
}

/// Lowercase, dots and anything else non-alphanumeric mapped to dashes.
pub fn sanitize_dns(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn spec_wire_names_match_contract() {
        let spec = AttackResponseSpec {
            services: vec!["shop-service".into()],
            decoy_count: 3,
            auto_cleanup_minutes: 15,
            source_ip: "10.0.0.9".into(),
            attack_type: "sqli".into(),
            severity: "critical".into(),
        };
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["sourceIP"], "10.0.0.9");
        assert_eq!(v["decoyCount"], 3);
        assert_eq!(v["autoCleanupMinutes"], 15);
        assert_eq!(v["attackType"], "sqli");
    }

    #[test]
    fn spec_defaults_apply_on_deserialize() {
        let spec: AttackResponseSpec = serde_json::from_str(
            r#"{"services":[],"sourceIP":"1.2.3.4","attackType":"sqli","severity":"critical"}"#,
        )
        .unwrap();
        assert_eq!(spec.decoy_count, 3);
        assert_eq!(spec.auto_cleanup_minutes, 15);
    }

    #[test]
    fn status_wire_names_match_contract() {
        let status = AttackResponseStatus {
            phase: Phase::Active,
            decoy_pods: vec!["d-mirror".into()],
            decoy_urls: vec!["http://d-mirror:8080".into()],
            created_at: Some("2026-08-01T00:00:00Z".into()),
            cleanup_scheduled_at: Some("2026-08-01T00:15:00Z".into()),
            message: Some("fleet ready".into()),
        };
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["phase"], "Active");
        assert_eq!(v["decoyPods"][0], "d-mirror");
        assert_eq!(v["decoyURLs"][0], "http://d-mirror:8080");
        assert_eq!(v["createdAt"], "2026-08-01T00:00:00Z");
        assert_eq!(v["cleanupScheduledAt"], "2026-08-01T00:15:00Z");
    }

    #[test]
    fn ttl_expiry_arithmetic() {
        let created = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let status = AttackResponseStatus {
            created_at: Some(created.to_rfc3339()),
            cleanup_scheduled_at: Some((created + chrono::Duration::minutes(15)).to_rfc3339()),
            ..Default::default()
        };
        assert!(!status.expired(created + chrono::Duration::minutes(14)));
        assert!(status.expired(created + chrono::Duration::minutes(15)));
        assert!(status.expired(created + chrono::Duration::minutes(16)));
    }

    #[test]
    fn unparseable_cleanup_time_never_expires() {
        let status = AttackResponseStatus {
            cleanup_scheduled_at: Some("yesterday".into()),
            ..Default::default()
        };
        assert!(!status.expired(Utc::now()));
        assert!(!AttackResponseStatus::default().expired(Utc::now()));
    }

    #[test]
    fn names_are_dns_safe_and_unique_per_instant() {
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let name = response_name("192.168.1.66", at);
        assert!(name.starts_with("attack-response-192-168-1-66-"));
        assert!(name.len() <= 63);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));

        let later = at + chrono::Duration::milliseconds(1);
        assert_ne!(response_name("192.168.1.66", at), response_name("192.168.1.66", later));
    }

    #[test]
    fn sanitize_collapses_oddities() {
        assert_eq!(sanitize_dns("10.0.0.9"), "10-0-0-9");
        assert_eq!(sanitize_dns("::ffff:1.2.3.4"), "ffff-1-2-3-4");
    }
}
