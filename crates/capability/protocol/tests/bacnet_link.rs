use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use domain::{DeviceConfig, DeviceData, EncodeMode, PointData};
use gw_protocol::bacnet::apdu::PropertyResult;
use gw_protocol::bacnet::encoding::property;
use gw_protocol::bacnet::{
    BacnetAdapter, BacnetEnv, BacnetLink, BacnetPlugin, BacnetTarget, BacnetValue, ObjectId,
    ObjectIo,
};
use gw_protocol::{Plugin, ProtocolError, ReceiveHandler, TaskSet};
use gw_storage::DeviceShadow;
use serde_json::{Value, json};

#[derive(Default)]
struct Recorder {
    frames: Mutex<Vec<DeviceData>>,
}

impl Recorder {
    fn value_of(&self, point: &str) -> Option<Value> {
        self.frames
            .lock()
            .expect("lock")
            .iter()
            .flat_map(|d| d.values.iter())
            .filter(|v| v.point_name == point)
            .last()
            .map(|v| v.value.clone())
    }
}

#[async_trait]
impl ReceiveHandler for Recorder {
    async fn handle(&self, data: Vec<DeviceData>) {
        self.frames.lock().expect("lock").extend(data);
    }
}

/// 内存中的远端设备：present value 初始为实例号。
#[derive(Default)]
struct FakeDevice {
    values: Mutex<HashMap<ObjectId, BacnetValue>>,
    reads: Mutex<Vec<usize>>,
    writes: Mutex<Vec<(ObjectId, BacnetValue, Option<u8>)>>,
}

#[async_trait]
impl ObjectIo for FakeDevice {
    async fn read_objects(
        &self,
        _target: &BacnetTarget,
        objects: &[ObjectId],
    ) -> Result<Vec<PropertyResult>, ProtocolError> {
        self.reads.lock().expect("lock").push(objects.len());
        let values = self.values.lock().expect("lock");
        let mut out = Vec::new();
        for object in objects {
            let value = values
                .get(object)
                .cloned()
                .unwrap_or(BacnetValue::Real(object.instance as f32));
            out.push(PropertyResult {
                object: *object,
                property: property::PRESENT_VALUE,
                index: None,
                value: Ok(vec![value]),
            });
            out.push(PropertyResult {
                object: *object,
                property: property::STATUS_FLAGS,
                index: None,
                value: Ok(vec![BacnetValue::BitString(vec![false; 4])]),
            });
        }
        Ok(out)
    }

    async fn write_present_value(
        &self,
        _target: &BacnetTarget,
        object: ObjectId,
        value: &BacnetValue,
        priority: Option<u8>,
    ) -> Result<(), ProtocolError> {
        self.values
            .lock()
            .expect("lock")
            .insert(object, value.clone());
        self.writes
            .lock()
            .expect("lock")
            .push((object, value.clone(), priority));
        Ok(())
    }
}

fn ahu_config() -> DeviceConfig {
    let mut points: Vec<Value> = (1..=19)
        .map(|i| {
            json!({
                "name": format!("temp{i}"),
                "valueType": "float",
                "readWrite": "R",
                "extends": {"objectType": "analogInput", "instance": i, "duration": "1s"}
            })
        })
        .collect();
    points.push(json!({
        "name": "setpoint",
        "valueType": "float",
        "readWrite": "RW",
        "extends": {"objectType": "analogValue", "instance": 100, "duration": "1s", "defaultPriority": 8}
    }));
    serde_json::from_value(json!({
        "key": "ahu",
        "protocolName": "bacnet",
        "connections": {"bip": {"mode": "ip", "localIp": "127.0.0.1", "localPort": 47809}},
        "deviceModels": [{
            "name": "ahu",
            "devicePoints": points,
            "devices": [{
                "deviceSn": "ahu-1", "modelName": "ahu", "connectionKey": "bip",
                "properties": {"id": "1001", "ip": "10.0.0.5"}
            }]
        }]
    }))
    .expect("config")
}

async fn plugin() -> (BacnetPlugin, Arc<FakeDevice>, Arc<Recorder>) {
    let config = ahu_config();
    let adapter = Arc::new(BacnetAdapter::new(&config, None).expect("adapter"));
    let recorder = Arc::new(Recorder::default());
    let shadow = DeviceShadow::new(Duration::from_secs(60));
    shadow.add_device("ahu-1", "ahu");
    let env = Arc::new(BacnetEnv {
        key: "ahu".to_string(),
        adapter,
        script: None,
        on_receive: recorder.clone(),
        shadow,
        watchers: TaskSet::new(),
    });
    let device = Arc::new(FakeDevice::default());
    let mut links = HashMap::new();
    links.insert(
        "bip".to_string(),
        BacnetLink::new("bip", Some(device.clone() as Arc<dyn ObjectIo>)),
    );
    let plugin = BacnetPlugin::with_links(env, links).await.expect("plugin");
    (plugin, device, recorder)
}

#[tokio::test]
async fn twenty_points_read_in_two_batches() {
    let (plugin, device, recorder) = plugin().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut reads = device.reads.lock().expect("lock").clone();
    reads.sort();
    assert_eq!(reads, vec![5, 15]);
    assert_eq!(recorder.value_of("temp7"), Some(json!(7.0)));
    assert_eq!(recorder.value_of("setpoint"), Some(json!(100.0)));

    plugin.destroy().await.expect("destroy");
}

#[tokio::test]
async fn write_uses_default_priority_and_reads_back() {
    let (plugin, device, recorder) = plugin().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let frame = plugin
        .protocol_adapter()
        .encode("ahu-1", EncodeMode::Write, &[PointData::new("setpoint", json!(21.5))])
        .expect("encode");
    let mut connector = plugin.connector("ahu-1").await.expect("connector");
    connector.send(frame).await.expect("write");
    connector.release();

    let writes = device.writes.lock().expect("lock").clone();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, BacnetValue::Real(21.5));
    assert_eq!(writes[0].2, Some(8));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(recorder.value_of("setpoint"), Some(json!(21.5)));

    plugin.destroy().await.expect("destroy");
}

#[tokio::test]
async fn read_only_point_cannot_be_written() {
    let (plugin, _device, _recorder) = plugin().await;
    let err = plugin
        .protocol_adapter()
        .encode("ahu-1", EncodeMode::Write, &[PointData::new("temp1", json!(1))])
        .expect_err("read-only");
    assert!(matches!(err, ProtocolError::UnsupportedOperation(_)));
    plugin.destroy().await.expect("destroy");
}
