//! File-level tests for the `api.json` loader.

use std::fs;

use mantaro_core::config::{Config, DEFAULT_CONFIG_FILE};
use mantaro_core::error::ErrorKind;

#[test]
fn test_load_reads_every_field_from_disk() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join(DEFAULT_CONFIG_FILE);
    fs::write(
        &path,
        r#"{
    "patreon_secret": "pk_live_9a8b",
    "patreon_token": "creator-token",
    "port": 6000,
    "check": true,
    "auth": "0b6c3c1e-5f0e-4a7e-9d42-7f1f8e2c9a11",
    "user_agent": "Mantaro/7 (+https://mantaro.site)"
}"#,
    )
    .expect("write");

    let config = Config::load(&path).expect("load");
    assert_eq!(config.patreon_secret, "pk_live_9a8b");
    assert_eq!(config.patreon_token, "creator-token");
    assert_eq!(config.port, 6000);
    assert!(config.check_old_patrons);
    assert_eq!(config.auth, "0b6c3c1e-5f0e-4a7e-9d42-7f1f8e2c9a11");
    assert_eq!(config.user_agent, "Mantaro/7 (+https://mantaro.site)");
}

#[test]
fn test_load_without_file_creates_template_and_stops() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join(DEFAULT_CONFIG_FILE);

    let err = Config::load(&path).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConfigTemplateCreated);
    assert!(path.exists());
}

#[test]
fn test_load_missing_user_agent_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join(DEFAULT_CONFIG_FILE);
    fs::write(
        &path,
        r#"{"patreon_secret": "a", "patreon_token": "b", "port": 1, "check": false, "auth": "c"}"#,
    )
    .expect("write");

    let err = Config::load(&path).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Configuration);
    assert!(err.message.contains("user_agent"), "{}", err.message);
}

#[test]
fn test_load_existing_file_is_not_rewritten() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join(DEFAULT_CONFIG_FILE);
    let original = r#"{"patreon_secret": "a", "patreon_token": "b", "port": 1, "check": false, "auth": "c", "user_agent": "d"}"#;
    fs::write(&path, original).expect("write");

    Config::load(&path).expect("load");
    assert_eq!(fs::read_to_string(&path).expect("read"), original);
}
