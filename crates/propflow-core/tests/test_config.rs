use propflow_core::config::{PropflowConfig, StorageBackend};
use propflow_types::RequestKind;
use std::io::Write;
use std::path::PathBuf;

#[test]
fn test_parse_full_config_json() {
    let json = r#"{
        "storage": {
            "backend": "file",
            "data_dir": "/srv/propflow"
        },
        "engine": {
            "max_retries": 5,
            "retry_backoff_ms": 10,
            "strict_step_order": ["verification_form"]
        },
        "events": {
            "channel_capacity": 64,
            "outbox": false,
            "poll_interval_secs": 2
        },
        "templates": {
            "off_campus_loan": [
                {"code": "prepared_by", "auto_approve_by_creator": true},
                {"code": "checked_by"},
                {"code": "approved_by"}
            ]
        }
    }"#;

    let config = PropflowConfig::from_json_str(json).expect("Failed to parse config");

    assert_eq!(config.storage.backend, StorageBackend::File);
    assert_eq!(config.storage.data_root, PathBuf::from("/srv/propflow"), "data_dir should map to data_root");
    assert_eq!(config.engine.max_retries, 5);
    assert_eq!(config.engine.retry_backoff_ms, 10);
    assert_eq!(config.engine.strict_step_order, vec![RequestKind::VerificationForm]);
    assert_eq!(config.events.channel_capacity, 64);
    assert!(!config.events.outbox);
    assert_eq!(config.events.poll_interval_secs, 2);

    let loan = &config.templates[&RequestKind::OffCampusLoan];
    assert_eq!(loan.len(), 3);
    assert!(loan[0].auto_approve_by_creator);
    assert!(!loan[1].auto_approve_by_creator);
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = PropflowConfig::from_json_str("{}").expect("Empty config should parse");

    assert_eq!(config.storage.backend, StorageBackend::File);
    assert_eq!(config.storage.data_root, PathBuf::from("/data/propflow"));
    assert_eq!(config.engine.max_retries, 3);
    assert_eq!(config.engine.retry_backoff_ms, 25);
    assert!(config.engine.strict_step_order.is_empty());
    assert_eq!(config.events.channel_capacity, 256);
    assert!(config.events.outbox);
    assert_eq!(config.events.poll_interval_secs, 5);
    assert!(config.templates.is_empty());
}

#[test]
fn test_invalid_configs_are_rejected() {
    let cases = [
        (r#"{"engine": {"max_retries": 0}}"#, "max_retries"),
        (r#"{"events": {"channel_capacity": 0}}"#, "channel_capacity"),
        (r#"{"storage": {"data_root": ""}}"#, "data_root"),
        (r#"{"templates": {"turnover_disposal": []}}"#, "no steps"),
        (r#"{"templates": {"transfer": [{"code": "prepared_by"}]}}"#, "no rejection status"),
        (r#"{"templates": {"verification_form": [{"code": "Prepared By"}]}}"#, "Invalid step code"),
        (
            r#"{"templates": {"verification_form": [{"code": "noted_by"}, {"code": "noted_by"}]}}"#,
            "Duplicate step code",
        ),
    ];

    for (json, expected) in cases {
        let error = PropflowConfig::from_json_str(json).unwrap_err();
        assert_eq!(error.code(), "config");
        assert!(
            error.to_string().contains(expected),
            "expected '{}' in error for {}: {}",
            expected,
            json,
            error
        );
    }
}

#[test]
fn test_memory_backend_needs_no_data_root() {
    let config = PropflowConfig::from_json_str(r#"{"storage": {"backend": "memory", "data_root": ""}}"#).unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Memory);
}

#[test]
fn test_unknown_kind_in_config_fails() {
    let error = PropflowConfig::from_json_str(r#"{"engine": {"strict_step_order": ["parking_permit"]}}"#).unwrap_err();
    assert_eq!(error.code(), "config");
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        r#"{{"storage": {{"backend": "memory"}}, "engine": {{"max_retries": 7}}}}"#
    )
    .unwrap();

    let config = PropflowConfig::from_file(file.path()).expect("Failed to load config file");
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.engine.max_retries, 7);
    assert_eq!(config.events.channel_capacity, 256);
}

#[test]
fn test_missing_file_is_a_config_error() {
    let error = PropflowConfig::from_file("/nonexistent/propflow.json").unwrap_err();
    assert_eq!(error.code(), "config");
}
