use super::*;
use std::path::Path;
use std::sync::Mutex;

// Env vars are process-global; serialize the tests that touch them.
static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn load_repo_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    let cfg = MirageConfig::load(Path::new("config.toml")).unwrap();
    assert!(!cfg.gateway.legitimate_service_url.is_empty());
    assert!(!cfg.detector.watch_labels.is_empty());
}

#[test]
fn missing_file_yields_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    let cfg = MirageConfig::load(Path::new("/nonexistent/mirage.toml")).unwrap();
    assert_eq!(cfg.gateway.port, 8080);
    assert_eq!(cfg.detector.rate_limit_threshold, 50);
    assert_eq!(cfg.controller.ttl_minutes, 15);
}

#[test]
fn env_overrides_apply() {
    let _guard = ENV_LOCK.lock().unwrap();
    std::env::set_var("PORT", "9000");
    std::env::set_var("NAMESPACE", "deception");
    std::env::set_var("RATE_LIMIT_THRESHOLD", "10");
    std::env::set_var("COOLDOWN_PERIOD", "30s");

    let cfg = MirageConfig::load(Path::new("/nonexistent/mirage.toml")).unwrap();

    std::env::remove_var("PORT");
    std::env::remove_var("NAMESPACE");
    std::env::remove_var("RATE_LIMIT_THRESHOLD");
    std::env::remove_var("COOLDOWN_PERIOD");

    assert_eq!(cfg.gateway.port, 9000);
    assert_eq!(cfg.detector.namespace, "deception");
    assert_eq!(cfg.controller.namespace, "deception");
    assert_eq!(cfg.detector.rate_limit_threshold, 10);
    assert_eq!(
        cfg.detector.cooldown_period().unwrap(),
        std::time::Duration::from_secs(30)
    );
}

#[test]
fn load_json_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    let json = r#"{
        "gateway": { "port": 8088, "legitimate_service_url": "http://shop:8080" },
        "detector": { "watch_labels": "app=storefront" },
        "controller": { "ttl_minutes": 5 }
    }"#;
    let tmp = std::env::temp_dir().join("mirage_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = MirageConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.gateway.port, 8088);
    assert_eq!(cfg.gateway.legitimate_service_url, "http://shop:8080");
    assert_eq!(cfg.detector.watch_labels, "app=storefront");
    assert_eq!(cfg.controller.ttl_minutes, 5);
}

#[test]
fn validate_rejects_bad_url() {
    let mut cfg = MirageConfig::default();
    cfg.gateway.legitimate_service_url = "not a url".into();
    assert!(cfg.validate().is_err());

    let mut cfg = MirageConfig::default();
    cfg.gateway.legitimate_service_url = "/relative/only".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_bad_duration() {
    let mut cfg = MirageConfig::default();
    cfg.detector.cooldown_period = "five minutes".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_zero_threshold() {
    let mut cfg = MirageConfig::default();
    cfg.detector.rate_limit_threshold = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_bad_label() {
    let mut cfg = MirageConfig::default();
    cfg.controller.gateway_label = "no-equals-sign".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn duration_fields_parse_humantime() {
    let cfg = DetectorConfig::default();
    assert_eq!(
        cfg.rate_limit_window().unwrap(),
        std::time::Duration::from_secs(60)
    );
    assert_eq!(
        cfg.cooldown_period().unwrap(),
        std::time::Duration::from_secs(300)
    );
}
