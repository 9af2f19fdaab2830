//! Persisted configuration loading

use std::io::Write;

use clap::Parser;
use tempfile::{tempdir, NamedTempFile};

use guardian::config::{Args, GuardianConfig};
use guardian::GuardianError;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn test_load_persisted_fields() {
    let file = write_config(
        r#"{"guardianToken": "s.guardian", "oktaURL": "https://example.okta.com/", "oktaToken": "00abc"}"#,
    );

    let config = GuardianConfig::load(file.path()).unwrap();
    assert_eq!(config.guardian_token(), "s.guardian");
    assert_eq!(config.okta_url(), "https://example.okta.com");
    assert_eq!(config.okta_token(), "00abc");
}

#[test]
fn test_missing_file_is_empty_config() {
    let dir = tempdir().unwrap();
    let config = GuardianConfig::load(&dir.path().join("guardian.json")).unwrap();
    assert_eq!(config, GuardianConfig::empty());
    assert!(config.okta_url().is_empty());
}

#[test]
fn test_partial_file_defaults_missing_fields() {
    let file = write_config(r#"{"guardianToken": "s.only"}"#);
    let config = GuardianConfig::load(file.path()).unwrap();
    assert_eq!(config.guardian_token(), "s.only");
    assert_eq!(config.okta_token(), "");
}

#[test]
fn test_invalid_json_is_config_error() {
    let file = write_config("{ not json");
    assert!(matches!(
        GuardianConfig::load(file.path()),
        Err(GuardianError::Config(_))
    ));
}

#[test]
fn test_non_http_okta_url_rejected() {
    let file = write_config(r#"{"oktaURL": "ftp://example.okta.com"}"#);
    assert!(matches!(
        GuardianConfig::load(file.path()),
        Err(GuardianError::Config(msg)) if msg.contains("oktaURL")
    ));
}

#[test]
fn test_okta_url_without_host_rejected() {
    let file = write_config(r#"{"oktaURL": "https://"}"#);
    assert!(matches!(
        GuardianConfig::load(file.path()),
        Err(GuardianError::Config(msg)) if msg.contains("oktaURL")
    ));
}

#[test]
fn test_debug_never_prints_tokens() {
    let file = write_config(
        r#"{"guardianToken": "s.very-secret", "oktaURL": "https://example.okta.com", "oktaToken": "00secret"}"#,
    );
    let rendered = format!("{:?}", GuardianConfig::load(file.path()).unwrap());
    assert!(!rendered.contains("very-secret"));
    assert!(!rendered.contains("00secret"));
    assert!(rendered.contains("example.okta.com"));
}

#[test]
fn test_production_args_point_at_config_file() {
    let file = write_config("{}");
    let path = file.path().to_str().unwrap();
    let args = Args::parse_from([
        "guardian",
        "--config",
        path,
        "--vault-addr",
        "http://127.0.0.1:8200",
    ]);

    assert!(args.validate().is_ok());
    assert_eq!(args.config.as_deref(), Some(file.path()));
}
