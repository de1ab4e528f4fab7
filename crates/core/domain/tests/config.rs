use domain::{DeviceConfig, DeviceEvent, PointReport, PointValueData, ReadWrite, ReportMode, ReportValue, TimerTaskType, ValueType};
use serde_json::json;

fn sample() -> serde_json::Value {
    json!({
        "protocolName": "modbus",
        "connections": { "conn-1": { "address": "127.0.0.1:502", "mode": "tcp" } },
        "deviceModels": [{
            "name": "meter",
            "devicePoints": [
                { "name": "voltage", "valueType": "float", "readWrite": "R",
                  "extends": { "primaryTable": "HOLDING_REGISTER", "startAddress": "40001", "rawType": "float32" } },
                { "name": "onOff", "valueType": "bool", "readWrite": "RW", "reportMode": "change" }
            ],
            "devices": [{ "id": "meter-1", "modelName": "meter", "connectionKey": "conn-1",
                          "properties": { "unitID": "1" } }]
        }],
        "tasks": [{ "type": "read_points", "interval": "1000",
                    "action": [{ "devices": ["meter-1"], "points": ["voltage"] }] }]
    })
}

#[test]
fn config_parses_with_defaults() {
    let config: DeviceConfig = serde_json::from_value(sample()).expect("parse config");
    assert_eq!(config.key, "");
    let model = &config.device_models[0];
    let voltage = model.point("voltage").expect("voltage");
    assert_eq!(voltage.value_type, ValueType::Float);
    assert_eq!(voltage.read_write, ReadWrite::R);
    assert_eq!(voltage.report_mode, ReportMode::Real);
    assert_eq!(model.point("onOff").expect("onOff").report_mode, ReportMode::Change);
    assert_eq!(model.devices[0].device_sn, "meter-1");

    let task = &config.tasks[0];
    assert_eq!(task.task_type, TimerTaskType::ReadPoints);
    assert_eq!(task.interval_ms(), Some(1000));
    let actions = task.read_points_actions().expect("actions");
    assert_eq!(actions[0].device_sns, vec!["meter-1".to_string()]);
    assert_eq!(actions[0].point_names, vec!["voltage".to_string()]);
}

#[test]
fn config_survives_serialize_then_parse() {
    let config: DeviceConfig = serde_json::from_value(sample()).expect("parse config");
    let text = serde_json::to_string(&config).expect("serialize");
    let again: DeviceConfig = serde_json::from_str(&text).expect("parse again");
    assert_eq!(config, again);
}

#[test]
fn report_record_shape() {
    let report = PointReport::new(
        "meter-1",
        vec![ReportValue {
            point_name: "voltage".to_string(),
            value_type: ValueType::Int,
            value: PointValueData::I64(4660),
        }],
    );
    let value = serde_json::to_value(&report).expect("serialize");
    assert_eq!(
        value,
        json!({
            "deviceSn": "meter-1",
            "sourceName": "default",
            "values": [{ "pointName": "voltage", "valueType": "int", "value": 4660 }]
        })
    );
}

#[test]
fn device_event_shape() {
    let event = DeviceEvent::online_change("meter-1", false, 1_700_000_000_000);
    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(
        value,
        json!({
            "eventType": "DeviceEvent",
            "reportTimestamp": 1_700_000_000_000i64,
            "eventData": { "deviceSN": "meter-1", "type": "Offline" }
        })
    );
}
