use std::fs;
use std::path::Path;

use domain::DeviceConfig;
use gw_config::{AppConfig, ConfigError, load_device_configs, restore_device_config, write_device_config};
use serde_json::{Value, json};

fn meter_config() -> Value {
    json!({
        "key": "ignored",
        "protocolName": "modbus",
        "connections": {"line-1": {"address": "127.0.0.1:502", "mode": "tcp"}},
        "deviceModels": [{
            "name": "meter",
            "devicePoints": [
                {"name": "volt", "valueType": "int", "readWrite": "R",
                 "extends": {"primaryTable": "HOLDING_REGISTER", "startAddress": 0, "rawType": "uint16"}}
            ],
            "devices": [{"deviceSn": "m-1", "modelName": "meter", "connectionKey": "line-1"}]
        }]
    })
}

fn write_dir(root: &Path, key: &str, config: &Value) {
    let dir = root.join(key);
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("config.json"), config.to_string()).expect("write");
}

#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("GATEWAY_HTTP_ADDR", "127.0.0.1:9000");
        std::env::set_var("GATEWAY_SHADOW_TTL_SECONDS", "2");
        std::env::set_var("GATEWAY_SHADOW_SWEEP_MS", "5000");
        std::env::set_var("GATEWAY_VIRTUAL", "on");
    }

    let config = AppConfig::from_env().expect("config");
    assert_eq!(config.http_addr, "127.0.0.1:9000");
    assert_eq!(config.shadow_ttl_seconds, 2);
    assert_eq!(config.shadow_sweep_ms, 2000);
    assert!(config.virtual_mode);
    assert!(config.mqtt.is_none());
}

#[test]
fn key_comes_from_directory_and_script_is_detected() {
    let root = tempfile::tempdir().expect("tempdir");
    write_dir(root.path(), "meters", &meter_config());
    fs::write(root.path().join("meters").join("converter.js"), "function decode(r) { return []; }")
        .expect("script");
    fs::write(root.path().join("README"), "not a connector").expect("file");

    let loaded = load_device_configs(root.path()).expect("load");
    assert_eq!(loaded.len(), 1);
    let dir = &loaded["meters"];
    assert_eq!(dir.config.key, "meters");
    assert!(dir.script.as_ref().is_some_and(|p| p.ends_with("converter.js")));
}

#[test]
fn duplicate_device_across_connectors_is_rejected() {
    let root = tempfile::tempdir().expect("tempdir");
    write_dir(root.path(), "a", &meter_config());
    let mut other = meter_config();
    other["deviceModels"][0]["name"] = json!("meter-b");
    other["deviceModels"][0]["devices"][0]["modelName"] = json!("meter-b");
    write_dir(root.path(), "b", &other);

    let err = load_device_configs(root.path()).expect_err("duplicate sn");
    assert!(matches!(err, ConfigError::Device { ref reason, .. } if reason.contains("m-1")));
}

#[test]
fn unresolved_connection_key_is_rejected() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = meter_config();
    config["deviceModels"][0]["devices"][0]["connectionKey"] = json!("line-9");
    write_dir(root.path(), "meters", &config);

    let err = load_device_configs(root.path()).expect_err("connection");
    assert!(err.to_string().contains("line-9"));
}

#[test]
fn unknown_protocol_is_rejected() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = meter_config();
    config["protocolName"] = json!("dlt645");
    write_dir(root.path(), "meters", &config);
    assert!(load_device_configs(root.path()).is_err());
}

#[test]
fn write_then_restore_round_trip() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config: DeviceConfig = serde_json::from_value(meter_config()).expect("parse");
    config.key = "meters".to_string();

    let previous = write_device_config(root.path(), &config).expect("write");
    assert!(previous.is_none());
    let loaded = load_device_configs(root.path()).expect("load");
    assert_eq!(loaded["meters"].config, config);

    restore_device_config(root.path(), "meters", previous).expect("restore");
    assert!(load_device_configs(root.path()).expect("load").is_empty());
}

#[test]
fn write_rejects_path_like_keys() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config: DeviceConfig = serde_json::from_value(meter_config()).expect("parse");
    config.key = "../escape".to_string();
    assert!(matches!(
        write_device_config(root.path(), &config),
        Err(ConfigError::Invalid(..))
    ));
}
