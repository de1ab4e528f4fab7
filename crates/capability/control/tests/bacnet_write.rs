use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use domain::{DeviceConfig, DeviceData, PointValueData};
use gw_control::{CommandDispatcher, ControlError, DeviceSender};
use gw_protocol::bacnet::apdu::PropertyResult;
use gw_protocol::bacnet::encoding::property;
use gw_protocol::bacnet::{
    BacnetAdapter, BacnetEnv, BacnetLink, BacnetPlugin, BacnetTarget, BacnetValue, ObjectId,
    ObjectIo, ObjectType,
};
use gw_protocol::{Plugin, ProtocolError, ReceiveHandler, Registry, TaskSet};
use gw_storage::DeviceShadow;
use serde_json::json;

struct Discard;

#[async_trait]
impl ReceiveHandler for Discard {
    async fn handle(&self, _data: Vec<DeviceData>) {}
}

/// 记录写操作的远端设备，读取一律返回 0。
#[derive(Default)]
struct FakeDevice {
    writes: Mutex<Vec<(ObjectId, BacnetValue, Option<u8>)>>,
}

#[async_trait]
impl ObjectIo for FakeDevice {
    async fn read_objects(
        &self,
        _target: &BacnetTarget,
        objects: &[ObjectId],
    ) -> Result<Vec<PropertyResult>, ProtocolError> {
        Ok(objects
            .iter()
            .map(|object| PropertyResult {
                object: *object,
                property: property::PRESENT_VALUE,
                index: None,
                value: Ok(vec![BacnetValue::Real(0.0)]),
            })
            .collect())
    }

    async fn write_present_value(
        &self,
        _target: &BacnetTarget,
        object: ObjectId,
        value: &BacnetValue,
        priority: Option<u8>,
    ) -> Result<(), ProtocolError> {
        self.writes
            .lock()
            .expect("lock")
            .push((object, value.clone(), priority));
        Ok(())
    }
}

struct Fixture {
    dispatcher: CommandDispatcher,
    shadow: DeviceShadow,
    plugin: Arc<BacnetPlugin>,
    device: Arc<FakeDevice>,
}

async fn fixture() -> Fixture {
    let config: DeviceConfig = serde_json::from_value(json!({
        "key": "ahu",
        "protocolName": "bacnet",
        "connections": {"bip": {"mode": "ip", "localIp": "127.0.0.1", "localPort": 47810}},
        "deviceModels": [{
            "name": "ahu",
            "devicePoints": [
                {"name": "setpoint", "valueType": "float", "readWrite": "RW",
                 "extends": {"objectType": "analogValue", "instance": 100, "defaultPriority": 8}},
                {"name": "enable", "valueType": "int", "readWrite": "RW",
                 "extends": {"objectType": "binaryValue", "instance": 5}}
            ],
            "devices": [{
                "deviceSn": "ahu-1", "modelName": "ahu", "connectionKey": "bip",
                "properties": {"id": "1001", "ip": "10.0.0.5"}
            }]
        }]
    }))
    .expect("config");

    let shadow = DeviceShadow::new(Duration::from_secs(60));
    shadow.add_device("ahu-1", "ahu");
    let env = Arc::new(BacnetEnv {
        key: "ahu".to_string(),
        adapter: Arc::new(BacnetAdapter::new(&config, None).expect("adapter")),
        script: None,
        on_receive: Arc::new(Discard),
        shadow: shadow.clone(),
        watchers: TaskSet::new(),
    });
    let device = Arc::new(FakeDevice::default());
    let mut links = HashMap::new();
    links.insert(
        "bip".to_string(),
        BacnetLink::new("bip", Some(device.clone() as Arc<dyn ObjectIo>)),
    );
    let plugin = Arc::new(BacnetPlugin::with_links(env, links).await.expect("plugin"));

    let mut configs = BTreeMap::new();
    configs.insert(config.key.clone(), config);
    let registry = Arc::new(Registry::build(&configs).expect("registry"));
    registry.add_running_plugin("ahu", plugin.clone() as Arc<dyn Plugin>);
    Fixture {
        dispatcher: CommandDispatcher::new(DeviceSender::new(registry, shadow.clone())),
        shadow,
        plugin,
        device,
    }
}

#[tokio::test]
async fn write_command_object_reaches_bacnet_adapter() {
    let fx = fixture().await;
    fx.dispatcher
        .handle_write(
            "ahu-1",
            &["setpoint".to_string()],
            &[json!({
                "value": 24.0,
                "priority": 10,
                "preOp": [{"pointName": "enable", "value": 1}]
            })],
        )
        .await
        .expect("write");

    let writes = fx.device.writes.lock().expect("lock").clone();
    assert_eq!(
        writes,
        vec![
            (ObjectId::new(ObjectType::BinaryValue, 5), BacnetValue::Enumerated(1), None),
            (ObjectId::new(ObjectType::AnalogValue, 100), BacnetValue::Real(24.0), Some(10)),
        ]
    );
    assert_eq!(
        fx.shadow.get_write_point_value("ahu-1", "setpoint"),
        Some(PointValueData::F64(24.0))
    );
    fx.plugin.destroy().await.expect("destroy");
}

#[tokio::test]
async fn write_command_string_and_bare_value() {
    let fx = fixture().await;
    fx.dispatcher
        .handle_write(
            "ahu-1",
            &["setpoint".to_string()],
            &[json!(r#"{"value": 19.5, "priority": 3}"#)],
        )
        .await
        .expect("string command");
    fx.dispatcher
        .handle_write("ahu-1", &["setpoint".to_string()], &[json!("21")])
        .await
        .expect("bare value");

    let writes = fx.device.writes.lock().expect("lock").clone();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].1, BacnetValue::Real(19.5));
    assert_eq!(writes[0].2, Some(3));
    assert_eq!(writes[1].1, BacnetValue::Real(21.0));
    assert_eq!(writes[1].2, Some(8));

    let err = fx
        .dispatcher
        .handle_write("ahu-1", &["setpoint".to_string()], &[json!("warm")])
        .await
        .expect_err("not a number");
    assert!(matches!(err, ControlError::BadRequest(_)));
    assert_eq!(fx.device.writes.lock().expect("lock").len(), 2);
    fx.plugin.destroy().await.expect("destroy");
}
