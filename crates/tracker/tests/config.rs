use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracker::config::{ENV_BATCH_SIZE, ENV_ENDPOINT, ENV_FLUSH_INTERVAL_MS, ENV_SCHEMA_PATH};
use tracker::{ConfigError, Tracker, TrackerConfig, TrackerError};

fn contract_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../contracts/analytics-schema.json")
}

#[test]
fn defaults_match_dispatch_policy() {
    let cfg = TrackerConfig::default();
    assert_eq!(cfg.batch_size, 20);
    assert_eq!(cfg.flush_interval_ms, 5_000);
    let d = cfg.dispatch_config();
    assert_eq!(d.flush_interval, Duration::from_millis(5_000));
}

#[test]
fn yaml_overrides_only_what_it_names() {
    let yaml = r#"
endpoint: "https://ingest.example.com/v1/events"
batch_size: 50
schema_path: contracts/analytics-schema.json
"#;
    let cfg = TrackerConfig::from_yaml_str(yaml).unwrap();
    assert_eq!(cfg.endpoint, "https://ingest.example.com/v1/events");
    assert_eq!(cfg.batch_size, 50);
    assert_eq!(cfg.flush_interval_ms, 5_000);
    assert_eq!(cfg.schema_path, Some(PathBuf::from("contracts/analytics-schema.json")));
    assert!(cfg.identity_path.is_none());
}

#[test]
fn yaml_file_loads() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), "endpoint: http://localhost:9000/ingest\nflush_interval_ms: 250\n")
        .unwrap();
    let cfg = TrackerConfig::from_yaml_path(tmp.path()).unwrap();
    assert_eq!(cfg.flush_interval_ms, 250);
}

#[test]
fn malformed_yaml_errors() {
    let res = TrackerConfig::from_yaml_str("batch_size: [1, 2]");
    assert!(matches!(res, Err(ConfigError::Yaml(_))));
}

#[test]
fn overrides_apply_on_top_of_file() {
    let env: HashMap<&str, &str> = HashMap::from([
        (ENV_ENDPOINT, "http://override/ingest"),
        (ENV_BATCH_SIZE, " 5 "),
        (ENV_SCHEMA_PATH, "/etc/beacon/contract.json"),
    ]);
    let mut cfg = TrackerConfig::default();
    cfg.apply_overrides(|k| env.get(k).map(|v| (*v).to_owned())).unwrap();
    assert_eq!(cfg.endpoint, "http://override/ingest");
    assert_eq!(cfg.batch_size, 5);
    assert_eq!(cfg.schema_path, Some(PathBuf::from("/etc/beacon/contract.json")));
}

#[test]
fn non_numeric_override_errors() {
    let mut cfg = TrackerConfig::default();
    let res = cfg.apply_overrides(|k| (k == ENV_FLUSH_INTERVAL_MS).then(|| "soon".to_owned()));
    match res {
        Err(ConfigError::Invalid { key, value }) => {
            assert_eq!(key, ENV_FLUSH_INTERVAL_MS);
            assert_eq!(value, "soon");
        }
        other => panic!("expected invalid value, got {other:?}"),
    }
}

#[tokio::test]
async fn from_config_requires_schema_and_endpoint() {
    let cfg = TrackerConfig { endpoint: "http://localhost:1/ingest".into(), ..Default::default() };
    assert!(matches!(
        Tracker::from_config(&cfg),
        Err(TrackerError::Config(ConfigError::MissingSchemaPath))
    ));

    let cfg = TrackerConfig { schema_path: Some(contract_path()), ..Default::default() };
    assert!(matches!(
        Tracker::from_config(&cfg),
        Err(TrackerError::Config(ConfigError::MissingEndpoint))
    ));
}

#[tokio::test]
async fn from_config_builds_with_durable_identity() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrackerConfig {
        endpoint: "http://127.0.0.1:9/ingest".into(),
        schema_path: Some(contract_path()),
        identity_path: Some(dir.path().join("identity.json")),
        ..Default::default()
    };
    let tr = Tracker::from_config(&cfg).unwrap();
    assert!(tr.registry().contains("item_viewed"));
    tr.track_event("item_viewed", serde_json::json!({"item_id": "sku-1"}));
    assert_eq!(tr.queue_len(), 1);
    assert!(dir.path().join("identity.json").exists());
}
