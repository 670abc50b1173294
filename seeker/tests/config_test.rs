//! Tests for config loading

use seeker::config::{DefaultOperator, RegistrationMode, SeekerConfig};
use seeker::Error;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn test_default_config() {
    let config = SeekerConfig::default();

    assert!(config.index_hosts.is_empty());
    assert_eq!(config.default_index_name, "seeker");
    assert_eq!(config.default_operator, DefaultOperator::And);
    assert_eq!(config.batch_size, 1000);
    assert_eq!(config.default_analyzer, "snowball");
    assert_eq!(config.registration_mode, RegistrationMode::Strict);
    assert!(config.prune_on_reindex);
    assert_eq!(config.max_concurrent_batches, 1);
    assert_eq!(config.request_timeout(), Duration::from_secs(30));
    assert!(!config.update_timestamp_index);
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_from_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("seeker.toml");
    std::fs::write(
        &path,
        r#"
index_hosts = ["http://search-1:9200", "http://search-2:9200"]
default_index_name = "library"
default_operator = "OR"
batch_size = 250
registration_mode = "permissive"
max_concurrent_batches = 4
update_timestamp_index = true

[retry]
max_retries = 5

[observability]
log_format = "json"
"#,
    )
    .unwrap();

    let config = SeekerConfig::load(&path).unwrap();

    assert_eq!(config.require_hosts().unwrap().len(), 2);
    assert_eq!(config.default_index_name, "library");
    assert_eq!(config.default_operator, DefaultOperator::Or);
    assert_eq!(config.batch_size, 250);
    assert_eq!(config.registration_mode, RegistrationMode::Permissive);
    assert_eq!(config.max_concurrent_batches, 4);
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.initial_backoff_ms, 100);
    assert_eq!(config.observability.log_format, "json");
    assert_eq!(config.timestamp_index_name, "timestamp");
}

#[test]
fn test_missing_file() {
    let temp = tempdir().unwrap();
    let result = SeekerConfig::load(&temp.path().join("absent.toml"));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_rejects_invalid_values() {
    for toml in [
        "batch_size = 0",
        "max_concurrent_batches = 0",
        "request_timeout_ms = 0",
        "default_index_name = \" \"",
        "index_hosts = [\"not a url\"]",
    ] {
        assert!(
            matches!(SeekerConfig::from_toml_str(toml), Err(Error::Config(_))),
            "{} should be rejected",
            toml
        );
    }
}

#[test]
fn test_hosts_required_for_network_backends() {
    let config = SeekerConfig::default();
    assert!(matches!(config.require_hosts(), Err(Error::Config(_))));
}

#[test]
fn test_malformed_toml() {
    assert!(matches!(
        SeekerConfig::from_toml_str("batch_size = \"many\""),
        Err(Error::Toml(_))
    ));
}
