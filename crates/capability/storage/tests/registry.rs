use std::collections::BTreeMap;
use std::sync::Arc;

use domain::DeviceConfig;
use gw_storage::{CoreCache, StorageError};
use serde_json::json;

trait FakePlugin: Send + Sync {
    fn name(&self) -> &str;
}

struct Named(&'static str);

impl FakePlugin for Named {
    fn name(&self) -> &str {
        self.0
    }
}

fn config(models: serde_json::Value) -> DeviceConfig {
    serde_json::from_value(json!({
        "protocolName": "modbus",
        "connections": { "conn-1": {} },
        "deviceModels": models,
    }))
    .expect("parse config")
}

fn sample() -> BTreeMap<String, DeviceConfig> {
    let mut configs = BTreeMap::new();
    configs.insert(
        "modbus-1".to_string(),
        config(json!([{
            "name": "meter",
            "devicePoints": [
                { "name": "voltage", "valueType": "float", "readWrite": "R" },
                { "name": "onOff", "valueType": "bool", "readWrite": "RW" }
            ],
            "devices": [
                { "deviceSn": "meter-1", "modelName": "meter", "connectionKey": "conn-1" },
                { "deviceSn": "meter-2", "modelName": "meter", "connectionKey": "conn-1" }
            ]
        }])),
    );
    configs
}

#[test]
fn point_lookup_by_device_matches_model() {
    let registry: CoreCache<dyn FakePlugin> = CoreCache::build(&sample()).expect("build");

    let model = registry.model("meter").expect("model");
    assert_eq!(model.protocol_name, "modbus");
    assert_eq!(model.connector_key, "modbus-1");

    for device in registry.devices() {
        for point in &model.points {
            assert_eq!(
                registry.point_by_device(&device.device_sn, &point.name),
                registry.point_by_model(&model.name, &point.name)
            );
        }
    }
    assert!(registry.point_by_device("meter-1", "missing").is_none());
    assert!(registry.device("missing").is_none());
    assert_eq!(registry.models().len(), 1);
}

#[test]
fn running_plugins_resolve_by_sn_model_and_key() {
    let registry: CoreCache<dyn FakePlugin> = CoreCache::build(&sample()).expect("build");
    assert!(registry.plugin("meter-1").is_none());

    registry.add_running_plugin("modbus-1", Arc::new(Named("modbus")) as Arc<dyn FakePlugin>);

    assert_eq!(registry.plugin("meter-1").expect("by sn").name(), "modbus");
    assert_eq!(registry.plugin_by_model("meter").expect("by model").name(), "modbus");
    assert_eq!(registry.plugin_by_key("modbus-1").expect("by key").name(), "modbus");

    let taken = registry.take_running_plugins();
    assert_eq!(taken.len(), 1);
    assert!(registry.plugin("meter-1").is_none());
}

#[test]
fn duplicate_device_is_rejected() {
    let mut configs = sample();
    configs.insert(
        "modbus-2".to_string(),
        config(json!([{
            "name": "meter-b",
            "devicePoints": [],
            "devices": [{ "deviceSn": "meter-1", "modelName": "meter-b", "connectionKey": "conn-1" }]
        }])),
    );
    let result: Result<CoreCache<dyn FakePlugin>, _> = CoreCache::build(&configs);
    assert!(matches!(result, Err(StorageError::Duplicate(_))));
}

#[test]
fn unknown_connection_is_rejected() {
    let mut configs = BTreeMap::new();
    configs.insert(
        "modbus-1".to_string(),
        config(json!([{
            "name": "meter",
            "devicePoints": [],
            "devices": [{ "deviceSn": "meter-1", "modelName": "meter", "connectionKey": "nope" }]
        }])),
    );
    let result: Result<CoreCache<dyn FakePlugin>, _> = CoreCache::build(&configs);
    assert!(matches!(result, Err(StorageError::Invalid(_))));
}
