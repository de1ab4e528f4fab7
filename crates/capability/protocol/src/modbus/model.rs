//! Modbus 连接配置、点位扩展属性与采集分组。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use domain::{Device, DeviceModel, Point};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ProtocolError;
use crate::modbus::address::{PrimaryTable, parse_address};
use crate::modbus::codec::{RawType, bit_mask};
use crate::types::duration_field;

/// 默认采集周期。
pub const DEFAULT_POINT_DURATION: Duration = Duration::from_secs(1);

/// 物理链路模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TransportMode {
    #[default]
    #[serde(rename = "tcp", alias = "TCP")]
    Tcp,
    #[serde(rename = "rtuovertcp", alias = "RTUOVERTCP", alias = "rtuOverTcp")]
    RtuOverTcp,
}

/// `connections.<key>` 配置。数值为 0 时回落到默认值。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// host:port
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub mode: TransportMode,
    /// 单次连续读取的最大寄存器数
    #[serde(default = "default_batch_len")]
    pub batch_read_len: u16,
    /// 单次批量写入的最大寄存器数
    #[serde(default = "default_batch_len")]
    pub batch_write_len: u16,
    /// 两次 IO 的最小间隔（毫秒）
    #[serde(default = "default_min_interval")]
    pub min_interval: u64,
    /// 请求超时（毫秒）
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// 写入重试次数
    #[serde(default = "default_retry")]
    pub retry: u32,
    #[serde(default, rename = "virtual")]
    pub virtual_mode: bool,
    #[serde(default = "default_enable")]
    pub enable: bool,
}

fn default_batch_len() -> u16 {
    32
}

fn default_min_interval() -> u64 {
    100
}

fn default_timeout() -> u64 {
    1000
}

fn default_retry() -> u32 {
    3
}

fn default_enable() -> bool {
    true
}

impl ConnectionConfig {
    pub fn normalized(mut self) -> Self {
        if self.batch_read_len == 0 {
            self.batch_read_len = default_batch_len();
        }
        if self.batch_write_len == 0 {
            self.batch_write_len = default_batch_len();
        }
        if self.min_interval == 0 {
            self.min_interval = default_min_interval();
        }
        if self.timeout == 0 {
            self.timeout = default_timeout();
        }
        if self.retry == 0 {
            self.retry = default_retry();
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointExtends {
    #[serde(default)]
    primary_table: Option<String>,
    #[serde(default)]
    start_address: Value,
    #[serde(default)]
    quantity: Option<u16>,
    #[serde(default)]
    raw_type: Option<String>,
    #[serde(default)]
    byte_swap: bool,
    #[serde(default)]
    word_swap: bool,
    #[serde(default)]
    bit: u32,
    #[serde(default)]
    bit_len: u32,
    #[serde(default)]
    mask: Option<Value>,
    #[serde(default)]
    duration: Option<Value>,
    #[serde(default, rename = "virtual")]
    virtual_point: bool,
    /// 虚拟点位的子点位名
    #[serde(default)]
    points: Vec<String>,
}

/// 绑定到具体设备的 Modbus 点位。
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusPoint {
    pub device_sn: String,
    pub name: String,
    pub unit_id: u8,
    pub table: PrimaryTable,
    pub address: u16,
    pub quantity: u16,
    pub raw_type: RawType,
    pub byte_swap: bool,
    pub word_swap: bool,
    pub bit: u32,
    /// 大于 0 时按位段读写
    pub bit_len: u32,
    pub mask: Option<u16>,
    pub duration: Duration,
    pub readable: bool,
    /// 虚拟点位声明的子点位名
    pub child_names: Vec<String>,
    /// 虚拟点位：一次读取后按子点位地址拆分
    pub children: Vec<ModbusPoint>,
}

impl ModbusPoint {
    /// 由点位 `extends` 构建。
    pub fn from_point(device_sn: &str, unit_id: u8, point: &Point) -> Result<Self, ProtocolError> {
        let ext: PointExtends = serde_json::from_value(Value::Object(point.extends.clone()))
            .map_err(|e| ProtocolError::Config(format!("point {}: {e}", point.name)))?;

        let parsed = parse_address(&ext.start_address)
            .map_err(|e| ProtocolError::Config(format!("point {}: {e}", point.name)))?;
        let explicit = ext
            .primary_table
            .as_deref()
            .map(PrimaryTable::parse)
            .transpose()?;
        let table = match (explicit, parsed.table) {
            (Some(a), Some(b)) if a != b => {
                return Err(ProtocolError::Config(format!(
                    "point {}: primaryTable {a:?} conflicts with address table {b:?}",
                    point.name
                )));
            }
            (Some(t), _) | (None, Some(t)) => t,
            (None, None) => {
                return Err(ProtocolError::Config(format!(
                    "point {}: primaryTable is required",
                    point.name
                )));
            }
        };

        let raw_type = match ext.raw_type.as_deref() {
            Some(raw) if !raw.is_empty() => raw.parse()?,
            _ => RawType::Uint16,
        };
        let quantity = if table.is_bit() {
            1
        } else {
            match (raw_type.register_count(), ext.quantity) {
                (Some(n), Some(q)) if usize::from(q) != n && !ext.virtual_point => {
                    return Err(ProtocolError::Config(format!(
                        "point {}: quantity {q} does not fit {}",
                        point.name,
                        raw_type.as_str()
                    )));
                }
                (_, Some(q)) if q > 0 => q,
                (Some(n), _) => n as u16,
                (None, _) => {
                    return Err(ProtocolError::Config(format!(
                        "point {}: string points need quantity",
                        point.name
                    )));
                }
            }
        };

        let mask = match ext.mask {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
            Some(Value::String(s)) => {
                let s = s.trim();
                match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => u16::from_str_radix(hex, 16).ok(),
                    None => s.parse().ok(),
                }
            }
            Some(_) => None,
        };
        let mask = match (mask, ext.bit_len) {
            (Some(m), _) => Some(m),
            (None, 0) => None,
            (None, len) => Some(bit_mask(ext.bit, len)),
        };

        Ok(Self {
            device_sn: device_sn.to_string(),
            name: point.name.clone(),
            unit_id,
            table,
            address: parsed.address,
            quantity,
            raw_type,
            byte_swap: ext.byte_swap,
            word_swap: ext.word_swap,
            bit: ext.bit,
            bit_len: ext.bit_len,
            mask,
            duration: duration_field(ext.duration.as_ref(), DEFAULT_POINT_DURATION)?,
            readable: point.read_write.readable(),
            child_names: if ext.virtual_point {
                ext.points
            } else {
                Vec::new()
            },
            children: Vec::new(),
        })
    }

    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.quantity)
    }

    pub fn is_virtual(&self) -> bool {
        !self.children.is_empty()
    }
}

/// 设备属性中的从站号（`unitID`，缺省 1）。
pub fn unit_id(device: &Device) -> Result<u8, ProtocolError> {
    match device
        .properties
        .get("unitID")
        .or_else(|| device.properties.get("uintID"))
    {
        None => Ok(1),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ProtocolError::Config(format!("device {}: invalid unitID {raw}", device.device_sn))
        }),
    }
}

/// 设备全部点位（含只写点位），虚拟点位已挂接子点位；被虚拟点位收纳的子点位不单独出现。
pub fn device_points(
    model: &DeviceModel,
    device: &Device,
) -> Result<Vec<ModbusPoint>, ProtocolError> {
    let unit = unit_id(device)?;
    let mut by_name = HashMap::new();
    for point in &model.device_points {
        by_name.insert(
            point.name.as_str(),
            ModbusPoint::from_point(&device.device_sn, unit, point)?,
        );
    }

    let mut adopted: Vec<&str> = Vec::new();
    let mut parents = Vec::new();
    for point in &model.device_points {
        let is_virtual = point
            .extends
            .get("virtual")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !is_virtual {
            continue;
        }
        let parent = &by_name[point.name.as_str()];
        if parent.child_names.is_empty() {
            return Err(ProtocolError::Config(format!(
                "virtual point {} declares no child points",
                point.name
            )));
        }
        let mut children = Vec::new();
        for child_name in &parent.child_names {
            let (name, child) = by_name.get_key_value(child_name.as_str()).ok_or_else(|| {
                ProtocolError::Config(format!(
                    "virtual point {}: unknown child {child_name}",
                    point.name
                ))
            })?;
            if child.table != parent.table
                || child.address < parent.address
                || child.end() > parent.end()
            {
                return Err(ProtocolError::Config(format!(
                    "virtual point {}: child {child_name} lies outside the parent window",
                    point.name
                )));
            }
            children.push(child.clone());
            adopted.push(*name);
        }
        check_tiling(&point.name, parent, &children)?;
        parents.push((point.name.as_str(), children));
    }

    for (name, children) in parents {
        if let Some(parent) = by_name.get_mut(name) {
            parent.children = children;
        }
    }
    Ok(model
        .device_points
        .iter()
        .filter(|p| !adopted.contains(&p.name.as_str()))
        .filter_map(|p| by_name.remove(p.name.as_str()))
        .collect())
}

/// 子点位按地址排序后须首尾相接地铺满父窗口。
fn check_tiling(
    name: &str,
    parent: &ModbusPoint,
    children: &[ModbusPoint],
) -> Result<(), ProtocolError> {
    let mut spans: Vec<(u32, u32, &str)> = children
        .iter()
        .map(|c| (u32::from(c.address), c.end(), c.name.as_str()))
        .collect();
    spans.sort();
    let mut cursor = u32::from(parent.address);
    for (start, end, child) in spans {
        if start < cursor {
            return Err(ProtocolError::Config(format!(
                "virtual point {name}: child {child} overlaps register {start}"
            )));
        }
        if start > cursor {
            return Err(ProtocolError::Config(format!(
                "virtual point {name}: gap before child {child} at register {cursor}"
            )));
        }
        cursor = end;
    }
    if cursor != parent.end() {
        return Err(ProtocolError::Config(format!(
            "virtual point {name}: registers {cursor}..{} not covered by any child",
            parent.end()
        )));
    }
    Ok(())
}

/// 一次连续读取。
#[derive(Debug, Clone, PartialEq)]
pub struct PointGroup {
    pub unit_id: u8,
    pub table: PrimaryTable,
    pub duration: Duration,
    pub address: u16,
    pub quantity: u16,
    pub points: Vec<Arc<ModbusPoint>>,
}

impl PointGroup {
    fn from_point(point: Arc<ModbusPoint>) -> Self {
        Self {
            unit_id: point.unit_id,
            table: point.table,
            duration: point.duration,
            address: point.address,
            quantity: point.quantity,
            points: vec![point],
        }
    }

    /// 点位区间与分组合并后的跨度不超过 `max_len` 时并入。
    fn try_merge(&mut self, point: &Arc<ModbusPoint>, max_len: u16) -> bool {
        if self.unit_id != point.unit_id
            || self.table != point.table
            || self.duration != point.duration
        {
            return false;
        }
        let start = u32::from(self.address.min(point.address));
        let end = (u32::from(self.address) + u32::from(self.quantity)).max(point.end());
        if end - start > u32::from(max_len) {
            return false;
        }
        self.address = start as u16;
        self.quantity = (end - start) as u16;
        self.points.push(point.clone());
        true
    }

    /// 涉及的设备（去重、保持顺序）。
    pub fn device_sns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for p in &self.points {
            if !out.contains(&p.device_sn) {
                out.push(p.device_sn.clone());
            }
        }
        out
    }
}

/// 按 (从站, 寄存器表, 周期) 合并点位，单组跨度不超过 `max_len`。
pub fn build_groups<I>(points: I, max_len: u16) -> Vec<PointGroup>
where
    I: IntoIterator<Item = Arc<ModbusPoint>>,
{
    let mut groups: Vec<PointGroup> = Vec::new();
    for point in points {
        if groups.iter_mut().any(|g| g.try_merge(&point, max_len)) {
            continue;
        }
        groups.push(PointGroup::from_point(point));
    }
    groups
}

/// 按设备 SN 与点位名索引的点位表。
pub type PointTable = HashMap<String, HashMap<String, Arc<ModbusPoint>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(name: &str, extends: Value) -> Point {
        serde_json::from_value(json!({
            "name": name,
            "valueType": "int",
            "readWrite": "RW",
            "extends": extends,
        }))
        .expect("point")
    }

    fn device(props: Value) -> Device {
        serde_json::from_value(json!({
            "deviceSn": "dev-1",
            "modelName": "m",
            "connectionKey": "c1",
            "properties": props,
        }))
        .expect("device")
    }

    #[test]
    fn test_connection_defaults() {
        let cfg: ConnectionConfig =
            serde_json::from_value(json!({"address": "127.0.0.1:502", "retry": 0}))
                .expect("config");
        let cfg = cfg.normalized();
        assert_eq!(cfg.batch_read_len, 32);
        assert_eq!(cfg.batch_write_len, 32);
        assert_eq!(cfg.retry, 3);
        assert_eq!(cfg.mode, TransportMode::Tcp);
        assert!(cfg.enable);
    }

    #[test]
    fn test_legacy_address_infers_table() {
        let p = ModbusPoint::from_point("d", 1, &point("t", json!({"startAddress": "30005"})))
            .expect("point");
        assert_eq!(p.table, PrimaryTable::InputRegister);
        assert_eq!(p.address, 4);
        assert_eq!(p.quantity, 1);
    }

    #[test]
    fn test_bit_len_builds_mask() {
        let p = ModbusPoint::from_point(
            "d",
            1,
            &point(
                "b",
                json!({"primaryTable": "HOLDING_REGISTER", "startAddress": 3, "bit": 4, "bitLen": 4}),
            ),
        )
        .expect("point");
        assert_eq!(p.mask, Some(0x00F0));
    }

    #[test]
    fn test_grouping_respects_span() {
        let mk = |addr: u16| {
            Arc::new(
                ModbusPoint::from_point(
                    "d",
                    1,
                    &point(
                        "p",
                        json!({"primaryTable": "HOLDING_REGISTER", "startAddress": addr, "rawType": "uint32"}),
                    ),
                )
                .expect("point"),
            )
        };
        let groups = build_groups(vec![mk(0), mk(10), mk(30), mk(40)], 32);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].address, 0);
        assert_eq!(groups[0].quantity, 32);
        assert_eq!(groups[1].address, 40);
    }

    #[test]
    fn test_virtual_point_children() {
        let model: DeviceModel = serde_json::from_value(json!({
            "name": "m",
            "devicePoints": [
                {"name": "all", "valueType": "int", "readWrite": "R",
                 "extends": {"primaryTable": "HOLDING_REGISTER", "startAddress": 0, "quantity": 3,
                             "virtual": true, "points": ["a", "b"]}},
                {"name": "a", "valueType": "int", "readWrite": "R",
                 "extends": {"primaryTable": "HOLDING_REGISTER", "startAddress": 0}},
                {"name": "b", "valueType": "int", "readWrite": "R",
                 "extends": {"primaryTable": "HOLDING_REGISTER", "startAddress": 1, "rawType": "uint32"}}
            ]
        }))
        .expect("model");
        let points = device_points(&model, &device(json!({"unitID": "2"}))).expect("points");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].unit_id, 2);
        assert_eq!(points[0].children.len(), 2);
    }

    #[test]
    fn test_virtual_child_outside_window_rejected() {
        let model: DeviceModel = serde_json::from_value(json!({
            "name": "m",
            "devicePoints": [
                {"name": "all", "valueType": "int", "readWrite": "R",
                 "extends": {"primaryTable": "HOLDING_REGISTER", "startAddress": 0, "quantity": 2,
                             "virtual": true, "points": ["far"]}},
                {"name": "far", "valueType": "int", "readWrite": "R",
                 "extends": {"primaryTable": "HOLDING_REGISTER", "startAddress": 9}}
            ]
        }))
        .expect("model");
        let err = device_points(&model, &device(json!({}))).expect_err("outside window");
        assert!(matches!(err, ProtocolError::Config(_)));
    }

    fn virtual_model(quantity: u16, children: Value) -> DeviceModel {
        let mut points = vec![json!({
            "name": "all", "valueType": "int", "readWrite": "R",
            "extends": {"primaryTable": "HOLDING_REGISTER", "startAddress": 0, "quantity": quantity,
                        "virtual": true, "points": ["a", "b"]}
        })];
        for (name, extends) in children.as_object().expect("children") {
            points.push(json!({"name": name, "valueType": "int", "readWrite": "R", "extends": extends}));
        }
        serde_json::from_value(json!({"name": "m", "devicePoints": points})).expect("model")
    }

    #[test]
    fn test_virtual_children_overlap_rejected() {
        let model = virtual_model(
            4,
            json!({
                "a": {"primaryTable": "HOLDING_REGISTER", "startAddress": 0, "rawType": "uint32"},
                "b": {"primaryTable": "HOLDING_REGISTER", "startAddress": 1}
            }),
        );
        let err = device_points(&model, &device(json!({}))).expect_err("overlap");
        assert!(matches!(err, ProtocolError::Config(ref m) if m.contains("overlaps")));
    }

    #[test]
    fn test_virtual_children_gap_rejected() {
        let model = virtual_model(
            3,
            json!({
                "a": {"primaryTable": "HOLDING_REGISTER", "startAddress": 0},
                "b": {"primaryTable": "HOLDING_REGISTER", "startAddress": 2}
            }),
        );
        let err = device_points(&model, &device(json!({}))).expect_err("gap");
        assert!(matches!(err, ProtocolError::Config(ref m) if m.contains("gap")));

        // 尾部未覆盖
        let model = virtual_model(
            4,
            json!({
                "a": {"primaryTable": "HOLDING_REGISTER", "startAddress": 0},
                "b": {"primaryTable": "HOLDING_REGISTER", "startAddress": 1}
            }),
        );
        let err = device_points(&model, &device(json!({}))).expect_err("tail");
        assert!(matches!(err, ProtocolError::Config(ref m) if m.contains("not covered")));

        // 乱序声明但首尾相接
        let model = virtual_model(
            3,
            json!({
                "b": {"primaryTable": "HOLDING_REGISTER", "startAddress": 1, "rawType": "uint32"},
                "a": {"primaryTable": "HOLDING_REGISTER", "startAddress": 0}
            }),
        );
        assert!(device_points(&model, &device(json!({}))).is_ok());
    }
}
