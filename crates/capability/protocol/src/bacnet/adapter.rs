//! BACnet 协议适配器：点位 → 读批次 / 写操作，读数 → 设备数据。

use std::collections::HashMap;
use std::sync::Arc;

use domain::{DeviceConfig, DeviceData, EncodeMode, PointData};
use gw_script::ScriptSandbox;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::bacnet::client::BacnetTarget;
use crate::bacnet::encoding::{BacnetValue, ObjectId, ObjectType};
use crate::bacnet::model::{BacnetPoint, ConnectionConfig, ReadBatch, RemoteDevice, build_batches};
use crate::error::ProtocolError;
use crate::plugin::{Frame, ProtocolAdapter};

/// 下发给连接器的 BACnet 命令。
#[derive(Debug, Clone)]
pub enum BacnetCommand {
    Read(Vec<ReadBatch>),
    /// 按顺序执行；前置写在主写之前
    Write(Vec<WriteOp>),
}

/// 一次 WriteProperty（PRESENT_VALUE）。
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub device_sn: String,
    pub point_name: String,
    pub device_id: u32,
    /// 未配置 ip 时由连接按 I-Am 解析
    pub target: Option<BacnetTarget>,
    pub object: ObjectId,
    /// `Null` 表示释放该优先级
    pub value: BacnetValue,
    pub priority: Option<u8>,
    /// 下发时的原始目标值（回读比对、虚拟写入）
    pub requested: Value,
    /// 写成功后回读确认
    pub read_back: bool,
}

/// 前置写：`{pointName, value}`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreOp {
    pub point_name: String,
    pub value: Value,
}

/// 写命令：`{value, priority, nullValue, preOp}`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteCommand {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default)]
    pub null_value: bool,
    #[serde(default)]
    pub pre_op: Vec<PreOp>,
}

impl WriteCommand {
    /// 对象形式的目标值视为完整命令，其余视为裸值。
    pub fn from_value(value: &Value, point: &BacnetPoint) -> Self {
        let parsed = match value {
            Value::Object(map) if map.contains_key("value") => {
                serde_json::from_value::<WriteCommand>(value.clone()).ok()
            }
            Value::String(s) if s.trim_start().starts_with('{') => {
                serde_json::from_str::<WriteCommand>(s).ok()
            }
            _ => None,
        };
        parsed.unwrap_or_else(|| WriteCommand {
            value: value.clone(),
            priority: point.default_priority,
            null_value: point.default_null,
            pre_op: Vec::new(),
        })
    }
}

fn json_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        Value::String(s) => match s.trim() {
            "true" | "on" => Some(1.0),
            "false" | "off" => Some(0.0),
            other => other.parse().ok(),
        },
        _ => None,
    }
}

/// 按对象类型转换写入值：模拟量 → Real，多态 → Unsigned，二进制 → 0/1。
pub fn write_value(object_type: ObjectType, value: &Value) -> Result<BacnetValue, ProtocolError> {
    let number = || {
        json_f64(value)
            .ok_or_else(|| ProtocolError::Encode(format!("{value} is not numeric")))
    };
    if object_type.is_analog() {
        Ok(BacnetValue::Real(number()? as f32))
    } else if object_type.is_multi_state() {
        let v = number()?;
        if v < 1.0 || v.fract() != 0.0 || v > f64::from(u32::MAX) {
            return Err(ProtocolError::Encode(format!("{value} is not a multi-state value")));
        }
        Ok(BacnetValue::Unsigned(v as u32))
    } else if object_type.is_binary() {
        let v = number()?;
        if v != 0.0 && v != 1.0 {
            return Err(ProtocolError::Encode(format!("{value} is not a binary value")));
        }
        Ok(BacnetValue::Enumerated(v as u32))
    } else {
        Err(ProtocolError::UnsupportedObjectType(format!("{object_type:?}")))
    }
}

struct AdapterDevice {
    connection_key: String,
    remote: RemoteDevice,
    points: Vec<Arc<BacnetPoint>>,
    by_name: HashMap<String, Arc<BacnetPoint>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadValue {
    #[serde(alias = "id")]
    device_sn: String,
    point_name: String,
    value: Value,
}

pub struct BacnetAdapter {
    key: String,
    connections: HashMap<String, ConnectionConfig>,
    devices: HashMap<String, AdapterDevice>,
    script: Option<Arc<ScriptSandbox>>,
}

impl BacnetAdapter {
    pub fn new(
        config: &DeviceConfig,
        script: Option<Arc<ScriptSandbox>>,
    ) -> Result<Self, ProtocolError> {
        let mut connections = HashMap::new();
        for (key, raw) in &config.connections {
            connections.insert(key.clone(), ConnectionConfig::parse(key, raw)?);
        }

        let mut devices = HashMap::new();
        for (model, device) in config.devices() {
            if !connections.contains_key(&device.connection_key) {
                return Err(ProtocolError::Config(format!(
                    "device {}: connection {} not found",
                    device.device_sn, device.connection_key
                )));
            }
            let remote = RemoteDevice::from_device(device)?;
            let mut points = Vec::with_capacity(model.device_points.len());
            let mut by_name = HashMap::new();
            for point in &model.device_points {
                let parsed = Arc::new(BacnetPoint::from_point(&device.device_sn, point)?);
                by_name.insert(parsed.name.clone(), parsed.clone());
                points.push(parsed);
            }
            devices.insert(
                device.device_sn.clone(),
                AdapterDevice {
                    connection_key: device.connection_key.clone(),
                    remote,
                    points,
                    by_name,
                },
            );
        }

        Ok(Self {
            key: config.key.clone(),
            connections,
            devices,
            script,
        })
    }

    pub fn connection_key(&self, device_sn: &str) -> Option<&str> {
        self.devices
            .get(device_sn)
            .map(|d| d.connection_key.as_str())
    }

    pub fn connections(&self) -> impl Iterator<Item = (&String, &ConnectionConfig)> {
        self.connections.iter()
    }

    pub fn remote(&self, device_sn: &str) -> Result<&RemoteDevice, ProtocolError> {
        self.devices
            .get(device_sn)
            .map(|d| &d.remote)
            .ok_or_else(|| ProtocolError::NotFound(format!("device {device_sn}")))
    }

    pub fn point(&self, device_sn: &str, point_name: &str) -> Result<Arc<BacnetPoint>, ProtocolError> {
        self.devices
            .get(device_sn)
            .ok_or_else(|| ProtocolError::NotFound(format!("device {device_sn}")))?
            .by_name
            .get(point_name)
            .cloned()
            .ok_or_else(|| ProtocolError::NotFound(format!("point {device_sn}/{point_name}")))
    }

    /// 连接下所有可读点位的采集批次（设备按 sn 排序，点位按配置顺序）。
    pub fn collect_batches(&self, connection_key: &str) -> Vec<ReadBatch> {
        let mut sns: Vec<&String> = self
            .devices
            .iter()
            .filter(|(_, d)| d.connection_key == connection_key)
            .map(|(sn, _)| sn)
            .collect();
        sns.sort();
        build_batches(sns.into_iter().flat_map(|sn| {
            let device = &self.devices[sn];
            device
                .points
                .iter()
                .filter(|p| p.readable)
                .map(move |p| (&device.remote, p.as_ref()))
        }))
    }

    /// 脚本可改写写命令。
    fn script_command(
        &self,
        device_sn: &str,
        command: WriteCommand,
    ) -> Result<WriteCommand, ProtocolError> {
        let Some(script) = self.script.as_ref().filter(|s| s.has_function("encode")) else {
            return Ok(command);
        };
        let payload = serde_json::to_value(&command)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        let result = script.encode(device_sn, &payload)?;
        match serde_json::from_value::<WriteCommand>(result) {
            Ok(rewritten) => {
                debug!(target: "gw.bacnet", key = %self.key, device_sn, "script rewrote write command");
                Ok(rewritten)
            }
            Err(e) => Err(ProtocolError::Encode(format!(
                "script encode returned malformed command: {e}"
            ))),
        }
    }

    fn write_op(
        &self,
        device_sn: &str,
        point: &BacnetPoint,
        value: Value,
        priority: Option<u8>,
        null_value: bool,
    ) -> Result<WriteOp, ProtocolError> {
        if !point.writable {
            return Err(ProtocolError::UnsupportedOperation(format!(
                "point {device_sn}/{} is read-only",
                point.name
            )));
        }
        let encoded = if null_value {
            BacnetValue::Null
        } else {
            write_value(point.object.object_type, &value)?
        };
        let remote = self.remote(device_sn)?;
        Ok(WriteOp {
            device_sn: device_sn.to_string(),
            point_name: point.name.clone(),
            device_id: remote.device_id,
            target: remote.target(),
            object: point.object,
            value: encoded,
            priority: priority.or(point.default_priority),
            requested: value,
            read_back: point.readable && !null_value,
        })
    }

    fn write_ops(&self, device_sn: &str, data: &PointData) -> Result<Vec<WriteOp>, ProtocolError> {
        let point = self.point(device_sn, &data.point_name)?;
        let command = WriteCommand::from_value(&data.value, &point);
        let command = self.script_command(device_sn, command)?;

        let mut ops = Vec::with_capacity(command.pre_op.len() + 1);
        for pre in &command.pre_op {
            let pre_point = self.point(device_sn, &pre.point_name)?;
            ops.push(self.write_op(
                device_sn,
                &pre_point,
                pre.value.clone(),
                None,
                false,
            )?);
        }
        ops.push(self.write_op(
            device_sn,
            &point,
            command.value,
            command.priority,
            command.null_value,
        )?);
        Ok(ops)
    }
}

impl ProtocolAdapter for BacnetAdapter {
    fn encode(
        &self,
        device_sn: &str,
        mode: EncodeMode,
        points: &[PointData],
    ) -> Result<Frame, ProtocolError> {
        match mode {
            EncodeMode::Read => {
                let remote = self.remote(device_sn)?;
                let mut targets = Vec::with_capacity(points.len());
                for p in points {
                    targets.push(self.point(device_sn, &p.point_name)?);
                }
                let batches = build_batches(targets.iter().map(|p| (remote, p.as_ref())));
                if batches.is_empty() {
                    return Err(ProtocolError::UnsupportedObjectType(format!(
                        "{device_sn}: no readable objects requested"
                    )));
                }
                Ok(Frame::Bacnet(BacnetCommand::Read(batches)))
            }
            EncodeMode::Write => {
                let mut ops = Vec::new();
                for p in points {
                    ops.extend(self.write_ops(device_sn, p)?);
                }
                Ok(Frame::Bacnet(BacnetCommand::Write(ops)))
            }
        }
    }

    fn decode(&self, raw: &str) -> Result<Vec<DeviceData>, ProtocolError> {
        if let Some(script) = self.script.as_ref().filter(|s| s.has_function("decode")) {
            return Ok(script.decode(raw)?);
        }
        let read: ReadValue =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(vec![DeviceData {
            device_sn: read.device_sn,
            values: vec![PointData::new(read.point_name, read.value)],
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> DeviceConfig {
        serde_json::from_value(json!({
            "key": "bacnet-demo",
            "protocolName": "bacnet",
            "connections": {"bip": {"mode": "ip", "localIp": "127.0.0.1", "localPort": 47809}},
            "deviceModels": [{
                "name": "ahu",
                "devicePoints": [
                    {"name": "temp", "valueType": "float", "readWrite": "R",
                     "extends": {"objectType": "analogInput", "instance": 1}},
                    {"name": "setpoint", "valueType": "float", "readWrite": "RW",
                     "extends": {"objectType": "analogValue", "instance": 2, "defaultPriority": 8}},
                    {"name": "mode", "valueType": "int", "readWrite": "RW",
                     "extends": {"objectType": "multiStateValue", "instance": 3}},
                    {"name": "enable", "valueType": "int", "readWrite": "W",
                     "extends": {"objectType": "binaryValue", "instance": 4}}
                ],
                "devices": [{
                    "deviceSn": "ahu-1", "modelName": "ahu", "connectionKey": "bip",
                    "properties": {"ip": "127.0.0.1", "port": "47900", "id": "1001"}
                }]
            }]
        }))
        .expect("config")
    }

    #[test]
    fn test_write_value_conversion() {
        assert_eq!(
            write_value(ObjectType::AnalogValue, &json!(21.5)).expect("analog"),
            BacnetValue::Real(21.5)
        );
        assert_eq!(
            write_value(ObjectType::MultiStateOutput, &json!("3")).expect("multi"),
            BacnetValue::Unsigned(3)
        );
        assert_eq!(
            write_value(ObjectType::BinaryOutput, &json!(true)).expect("binary"),
            BacnetValue::Enumerated(1)
        );
        assert!(write_value(ObjectType::BinaryOutput, &json!(2)).is_err());
        assert!(matches!(
            write_value(ObjectType::LargeAnalogValue, &json!(1)),
            Err(ProtocolError::UnsupportedObjectType(_))
        ));
    }

    #[test]
    fn test_collect_batches_skip_write_only() {
        let adapter = BacnetAdapter::new(&config(), None).expect("adapter");
        let batches = adapter.collect_batches("bip");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].objects.len(), 3);
        assert_eq!(batches[0].device_id, 1001);
        assert_eq!(
            batches[0].target.as_ref().map(|t| t.addr.port()),
            Some(47900)
        );
    }

    #[test]
    fn test_encode_write_with_pre_op() {
        let adapter = BacnetAdapter::new(&config(), None).expect("adapter");
        let command = json!({
            "value": 24.0,
            "priority": 10,
            "preOp": [{"pointName": "mode", "value": 2}]
        });
        let frame = adapter
            .encode("ahu-1", EncodeMode::Write, &[PointData::new("setpoint", command)])
            .expect("encode");
        let Frame::Bacnet(BacnetCommand::Write(ops)) = frame else {
            panic!("expected bacnet write");
        };
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].point_name, "mode");
        assert_eq!(ops[0].value, BacnetValue::Unsigned(2));
        assert_eq!(ops[1].value, BacnetValue::Real(24.0));
        assert_eq!(ops[1].priority, Some(10));
        assert!(ops[1].read_back);
    }

    #[test]
    fn test_encode_write_defaults() {
        let adapter = BacnetAdapter::new(&config(), None).expect("adapter");
        let frame = adapter
            .encode("ahu-1", EncodeMode::Write, &[PointData::new("setpoint", json!(22))])
            .expect("encode");
        let Frame::Bacnet(BacnetCommand::Write(ops)) = frame else {
            panic!("expected bacnet write");
        };
        assert_eq!(ops[0].priority, Some(8));

        let err = adapter
            .encode("ahu-1", EncodeMode::Write, &[PointData::new("temp", json!(1))])
            .expect_err("read-only");
        assert!(matches!(err, ProtocolError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_decode_plain_read() {
        let adapter = BacnetAdapter::new(&config(), None).expect("adapter");
        let data = adapter
            .decode(r#"{"deviceSn":"ahu-1","pointName":"temp","value":21.5,"status":{}}"#)
            .expect("decode");
        assert_eq!(data[0].device_sn, "ahu-1");
        assert_eq!(data[0].values[0].value, json!(21.5));
    }
}
