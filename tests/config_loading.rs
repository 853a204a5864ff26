//! Configuration loading and validation against real files.

use std::io::Write;

use tempchar::config::{EngineConfig, DEFAULT_CONFIG_PATH};
use tempchar::report::ReportEncoding;
use tempchar::settings::Category;
use tempchar::DeviceId;

fn shipped_config() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH)
}

#[test]
fn test_shipped_config_is_valid() {
    let config = EngineConfig::load_from(shipped_config()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.application.name, "tempchar");
    assert_eq!(config.run.temperatures, vec![-40.0, 25.0, 85.0]);
    assert_eq!(config.output.encoding, ReportEncoding::Utf8);

    let tabs = config.tab_set();
    assert_eq!(tabs.enabled_categories(), vec![Category::Sweep, Category::Vi]);
}

#[test]
fn test_shipped_config_builds_registry() {
    let config = EngineConfig::load_from(shipped_config()).unwrap();
    let registry = tempchar::registry::DeviceRegistry::from_entries(&config.devices).unwrap();

    let checked = registry.checked_ids();
    assert!(checked.contains(&DeviceId::Relay));
    assert!(!checked.contains(&DeviceId::Osc));
    assert_eq!(registry.slot(DeviceId::Relay).unwrap().address, "FT5XKQ1");
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert!(config.validate().is_ok());
    assert!(config.devices.is_empty());
    assert_eq!(config.run.sample_count, 1);
}

#[test]
fn test_invalid_sample_count_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[run]\nmulti_sample = true\nsample_count = 7\n"
    )
    .unwrap();

    let config = EngineConfig::load_from(file.path()).unwrap();
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("Sample count 7"));
}

#[test]
fn test_unknown_device_id_fails_to_load() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[[devices]]\nid = \"SCOPE9\"\nchecked = true\n").unwrap();

    assert!(EngineConfig::load_from(file.path()).is_err());
}
