//! Modbus 协议适配器：点位 → 读组 / 写请求，读数 → 设备数据。

use std::collections::HashMap;
use std::sync::Arc;

use domain::{DeviceConfig, DeviceData, EncodeMode, PointData};
use gw_script::ScriptSandbox;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ProtocolError;
use crate::modbus::address::PrimaryTable;
use crate::modbus::codec::{RawType, ScalarValue, encode_scalar};
use crate::modbus::connector::{ModbusCommand, WriteRequest};
use crate::modbus::model::{ConnectionConfig, ModbusPoint, PointGroup, build_groups, device_points};
use crate::plugin::{Frame, ProtocolAdapter};
use crate::types::connection_config;

struct AdapterDevice {
    connection_key: String,
    /// 顶层点位（采集用）
    points: Vec<Arc<ModbusPoint>>,
    /// 按名称索引，含虚拟点位的子点位
    by_name: HashMap<String, Arc<ModbusPoint>>,
}

pub struct ModbusAdapter {
    key: String,
    connections: HashMap<String, ConnectionConfig>,
    devices: HashMap<String, AdapterDevice>,
    script: Option<Arc<ScriptSandbox>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadValue {
    #[serde(alias = "id")]
    device_sn: String,
    point_name: String,
    value: Value,
}

impl ModbusAdapter {
    pub fn new(
        config: &DeviceConfig,
        script: Option<Arc<ScriptSandbox>>,
    ) -> Result<Self, ProtocolError> {
        let mut connections = HashMap::new();
        for (key, raw) in &config.connections {
            let cfg: ConnectionConfig = connection_config(key, raw)?;
            connections.insert(key.clone(), cfg.normalized());
        }

        let mut devices = HashMap::new();
        for (model, device) in config.devices() {
            if !connections.contains_key(&device.connection_key) {
                return Err(ProtocolError::Config(format!(
                    "device {}: connection {} not found",
                    device.device_sn, device.connection_key
                )));
            }
            let points: Vec<Arc<ModbusPoint>> = device_points(model, device)?
                .into_iter()
                .map(Arc::new)
                .collect();
            let mut by_name = HashMap::new();
            for point in &points {
                for child in &point.children {
                    by_name.insert(child.name.clone(), Arc::new(child.clone()));
                }
                by_name.insert(point.name.clone(), point.clone());
            }
            devices.insert(
                device.device_sn.clone(),
                AdapterDevice {
                    connection_key: device.connection_key.clone(),
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

    pub fn point(&self, device_sn: &str, point_name: &str) -> Result<Arc<ModbusPoint>, ProtocolError> {
        self.devices
            .get(device_sn)
            .ok_or_else(|| ProtocolError::NotFound(format!("device {device_sn}")))?
            .by_name
            .get(point_name)
            .cloned()
            .ok_or_else(|| ProtocolError::NotFound(format!("point {device_sn}/{point_name}")))
    }

    fn batch_read_len(&self, device_sn: &str) -> u16 {
        self.connection_key(device_sn)
            .and_then(|key| self.connections.get(key))
            .map(|c| c.batch_read_len)
            .unwrap_or(32)
    }

    fn batch_write_len(&self, device_sn: &str) -> u16 {
        self.connection_key(device_sn)
            .and_then(|key| self.connections.get(key))
            .map(|c| c.batch_write_len)
            .unwrap_or(32)
    }

    /// 连接下所有可读点位的采集分组。
    pub fn collect_groups(&self, connection_key: &str) -> Vec<PointGroup> {
        let max_len = self
            .connections
            .get(connection_key)
            .map(|c| c.batch_read_len)
            .unwrap_or(32);
        let mut sns: Vec<&String> = self
            .devices
            .iter()
            .filter(|(_, d)| d.connection_key == connection_key)
            .map(|(sn, _)| sn)
            .collect();
        sns.sort();
        let points = sns
            .into_iter()
            .flat_map(|sn| self.devices[sn].points.iter())
            .filter(|p| p.readable)
            .cloned();
        build_groups(points, max_len)
    }

    /// 目标值 → 寄存器序列。
    pub fn write_registers(point: &ModbusPoint, value: &Value) -> Result<Vec<u16>, ProtocolError> {
        match point.table {
            PrimaryTable::Coil => {
                let on = match value {
                    Value::Bool(b) => *b,
                    Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                    Value::String(s) => matches!(s.trim(), "1" | "true" | "on"),
                    other => {
                        return Err(ProtocolError::Encode(format!("{other} is not a coil value")));
                    }
                };
                Ok(vec![u16::from(on)])
            }
            PrimaryTable::DiscreteInput | PrimaryTable::InputRegister => Err(
                ProtocolError::UnsupportedOperation(format!("{:?} is read-only", point.table)),
            ),
            PrimaryTable::HoldingRegister if point.bit_len > 0 => {
                let raw = ScalarValue::from_json(RawType::Uint16, value)?;
                let v = raw.as_u64().unwrap_or(0);
                if point.bit_len < 16 && v >= (1u64 << point.bit_len) {
                    return Err(ProtocolError::Encode(format!(
                        "{v} does not fit in {} bits",
                        point.bit_len
                    )));
                }
                let reg = ((v << point.bit) & 0xFFFF) as u16;
                Ok(vec![if point.byte_swap { reg.swap_bytes() } else { reg }])
            }
            PrimaryTable::HoldingRegister => {
                let scalar = ScalarValue::from_json(point.raw_type, value)?;
                let mut regs = encode_scalar(&scalar, point.byte_swap, point.word_swap);
                if matches!(scalar, ScalarValue::Str(_)) {
                    if regs.len() > usize::from(point.quantity) {
                        return Err(ProtocolError::Encode(format!(
                            "string too long for {} registers",
                            point.quantity
                        )));
                    }
                    regs.resize(usize::from(point.quantity), 0);
                }
                Ok(regs)
            }
        }
    }

    fn write_request(
        &self,
        device_sn: &str,
        data: &PointData,
    ) -> Result<WriteRequest, ProtocolError> {
        let point = self.point(device_sn, &data.point_name)?;
        let mut values = Self::write_registers(&point, &data.value)?;

        if let Some(script) = self.script.as_ref().filter(|s| s.has_function("encode")) {
            let payload = json!({
                "name": data.point_name,
                "targetValue": data.value,
                "values": values,
            });
            let result = script.encode(device_sn, &payload)?;
            if result.get("name").and_then(Value::as_str) == Some(data.point_name.as_str())
                && let Some(adopted) = result
                    .get("values")
                    .and_then(|v| serde_json::from_value::<Vec<u16>>(v.clone()).ok())
            {
                debug!(target: "gw.modbus", key = %self.key, device_sn, point = %data.point_name, "script rewrote write values");
                values = adopted;
            }
        }

        let mask = match (point.mask, point.byte_swap && point.bit_len > 0) {
            (Some(m), true) => Some(m.swap_bytes()),
            (m, _) => m,
        };
        Ok(WriteRequest {
            device_sn: device_sn.to_string(),
            unit_id: point.unit_id,
            table: point.table,
            address: point.address,
            values,
            mask,
            points: vec![(data.point_name.clone(), data.value.clone())],
        })
    }

    /// 合并同一从站上地址连续、无掩码的保持寄存器写入。
    pub fn merge_writes(mut requests: Vec<WriteRequest>, max_len: u16) -> Vec<WriteRequest> {
        requests.sort_by_key(|r| (r.unit_id, r.address));
        let mut merged: Vec<WriteRequest> = Vec::new();
        for request in requests {
            let mergeable = |r: &WriteRequest| {
                r.table == PrimaryTable::HoldingRegister && !r.needs_read_modify_write()
            };
            if let Some(prev) = merged.last_mut()
                && mergeable(prev)
                && mergeable(&request)
                && prev.unit_id == request.unit_id
                && usize::from(prev.address) + prev.values.len() == usize::from(request.address)
                && prev.values.len() + request.values.len() <= usize::from(max_len)
            {
                prev.values.extend(request.values);
                prev.points.extend(request.points);
                continue;
            }
            merged.push(request);
        }
        merged
    }
}

impl ProtocolAdapter for ModbusAdapter {
    fn encode(
        &self,
        device_sn: &str,
        mode: EncodeMode,
        points: &[PointData],
    ) -> Result<Frame, ProtocolError> {
        match mode {
            EncodeMode::Read => {
                let mut targets = Vec::with_capacity(points.len());
                for p in points {
                    targets.push(self.point(device_sn, &p.point_name)?);
                }
                Ok(Frame::Modbus(ModbusCommand::Read(build_groups(
                    targets,
                    self.batch_read_len(device_sn),
                ))))
            }
            EncodeMode::Write => {
                let mut requests = Vec::with_capacity(points.len());
                for p in points {
                    requests.push(self.write_request(device_sn, p)?);
                }
                Ok(Frame::Modbus(ModbusCommand::Write(Self::merge_writes(
                    requests,
                    self.batch_write_len(device_sn),
                ))))
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

    fn request(address: u16, values: Vec<u16>, mask: Option<u16>) -> WriteRequest {
        WriteRequest {
            device_sn: "d".to_string(),
            unit_id: 1,
            table: PrimaryTable::HoldingRegister,
            address,
            values,
            mask,
            points: vec![(format!("p{address}"), Value::Null)],
        }
    }

    #[test]
    fn test_merge_contiguous_writes() {
        let merged = ModbusAdapter::merge_writes(
            vec![
                request(12, vec![3], None),
                request(10, vec![1, 2], None),
                request(20, vec![9], None),
            ],
            32,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].address, 10);
        assert_eq!(merged[0].values, vec![1, 2, 3]);
        assert_eq!(merged[0].points.len(), 2);
    }

    #[test]
    fn test_merge_respects_limit_and_mask() {
        let merged = ModbusAdapter::merge_writes(
            vec![request(0, vec![1, 2], None), request(2, vec![3], None)],
            2,
        );
        assert_eq!(merged.len(), 2);

        let merged = ModbusAdapter::merge_writes(
            vec![request(0, vec![1], None), request(1, vec![3], Some(0x00FF))],
            32,
        );
        assert_eq!(merged.len(), 2);
    }
}
