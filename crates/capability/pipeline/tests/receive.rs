use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use domain::{DeviceConfig, DeviceData, PointData, PointReport, PointValueData};
use gw_pipeline::{PipelineError, Publisher, ReceivePipeline};
use gw_protocol::{ReceiveHandler, Registry};
use gw_script::{PluginCache, ScriptSandbox};
use gw_storage::DeviceShadow;
use serde_json::{Value, json};
use tokio::sync::mpsc;

#[derive(Default)]
struct RecordingPublisher {
    reports: Mutex<Vec<PointReport>>,
}

impl RecordingPublisher {
    fn reports(&self) -> Vec<PointReport> {
        self.reports.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, report: PointReport) -> Result<(), PipelineError> {
        self.reports.lock().expect("lock").push(report);
        Ok(())
    }
}

fn config() -> DeviceConfig {
    serde_json::from_value(json!({
        "key": "room",
        "protocolName": "mqtt",
        "connections": {"broker": {"address": "127.0.0.1:1883"}},
        "deviceModels": [{
            "name": "thermostat",
            "devicePoints": [
                {"name": "onOff", "valueType": "int", "readWrite": "RW"},
                {"name": "temp", "valueType": "float", "readWrite": "R"},
                {"name": "mode", "valueType": "string", "readWrite": "RW", "reportMode": "periodic", "timerReport": "1s"}
            ],
            "devices": [{"deviceSn": "t-1", "modelName": "thermostat", "connectionKey": "broker"}]
        }]
    }))
    .expect("config")
}

struct Fixture {
    pipeline: Arc<ReceivePipeline>,
    publisher: Arc<RecordingPublisher>,
    shadow: DeviceShadow,
}

fn fixture() -> Fixture {
    let config = config();
    let mut configs = BTreeMap::new();
    configs.insert(config.key.clone(), config);
    let registry: Registry = Registry::build(&configs).expect("registry");
    let shadow = DeviceShadow::new(Duration::from_secs(60));
    shadow.add_device("t-1", "thermostat");
    let publisher = Arc::new(RecordingPublisher::default());
    let pipeline = Arc::new(ReceivePipeline::new(
        Arc::new(registry),
        shadow.clone(),
        publisher.clone(),
    ));
    Fixture {
        pipeline,
        publisher,
        shadow,
    }
}

fn frame(values: Vec<(&str, Value)>) -> Vec<DeviceData> {
    vec![DeviceData {
        device_sn: "t-1".to_string(),
        values: values
            .into_iter()
            .map(|(name, value)| PointData::new(name, value))
            .collect(),
    }]
}

#[tokio::test]
async fn string_one_on_int_point_holding_one_is_not_published() {
    let fx = fixture();
    fx.shadow
        .set_point("t-1", "onOff", PointValueData::I64(1))
        .expect("seed");

    let published = fx
        .pipeline
        .process(frame(vec![("onOff", json!("1"))]))
        .await
        .expect("process");

    assert_eq!(published, 0);
    assert!(fx.publisher.reports().is_empty());
}

#[tokio::test]
async fn accepted_values_are_batched_per_frame_in_order() {
    let fx = fixture();
    fx.pipeline
        .handle(frame(vec![("temp", json!("21.5")), ("onOff", json!(true))]))
        .await;

    let reports = fx.publisher.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].source_name, "default");
    let names: Vec<&str> = reports[0].values.iter().map(|v| v.point_name.as_str()).collect();
    assert_eq!(names, vec!["temp", "onOff"]);
    assert_eq!(reports[0].values[0].value, PointValueData::F64(21.5));
    assert_eq!(reports[0].values[1].value, PointValueData::I64(1));
    assert_eq!(fx.shadow.is_online("t-1"), Some(true));
}

#[tokio::test]
async fn unknown_and_unconvertible_values_are_dropped() {
    let fx = fixture();
    let published = fx
        .pipeline
        .process(frame(vec![
            ("nope", json!(1)),
            ("temp", json!("hot")),
            ("mode", json!("auto")),
        ]))
        .await
        .expect("process");

    assert_eq!(published, 1);
    let reports = fx.publisher.reports();
    assert_eq!(reports[0].values.len(), 1);
    assert_eq!(reports[0].values[0].point_name, "mode");
    assert_eq!(fx.shadow.get_point("t-1", "temp"), None);
}

#[tokio::test]
async fn republish_sends_current_shadow_values() {
    let fx = fixture();
    fx.pipeline
        .process(frame(vec![("mode", json!("cool"))]))
        .await
        .expect("process");
    let count = fx
        .pipeline
        .republish("t-1", &["mode".to_string(), "temp".to_string()])
        .await
        .expect("republish");

    assert_eq!(count, 1);
    let reports = fx.publisher.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].values[0].value, PointValueData::String("cool".to_string()));
}

#[tokio::test]
async fn script_publish_goes_through_pipeline() {
    let fx = fixture();
    let (tx, rx) = mpsc::unbounded_channel();
    let drain = fx.pipeline.spawn_script_drain(rx);
    let script = ScriptSandbox::from_source(
        "room",
        r#"function tick() { publish("t-1", { temp: 19.5 }); }"#,
        PluginCache::new(),
        tx,
    )
    .expect("script");

    script.call("tick", &[]).expect("call");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reports = fx.publisher.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].values[0].value, PointValueData::F64(19.5));
    drain.abort();
}

#[tokio::test]
async fn script_publish_keeps_point_order() {
    let fx = fixture();
    let (tx, rx) = mpsc::unbounded_channel();
    let drain = fx.pipeline.spawn_script_drain(rx);
    let script = ScriptSandbox::from_source(
        "room",
        r#"function tick() { publish("t-1", { temp: 18, onOff: 1, mode: "heat" }); }"#,
        PluginCache::new(),
        tx,
    )
    .expect("script");

    script.call("tick", &[]).expect("call");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reports = fx.publisher.reports();
    assert_eq!(reports.len(), 1);
    let names: Vec<&str> = reports[0].values.iter().map(|v| v.point_name.as_str()).collect();
    assert_eq!(names, vec!["temp", "onOff", "mode"]);
    drain.abort();
}
