//! 驱动配置树。
//!
//! 每个驱动目录 `<configDir>/<key>/config.json` 对应一个 [`DeviceConfig`]，
//! 字段命名与 JSON 保持一致（camelCase）。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 单个驱动目录的完整配置。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// 驱动目录名，加载时以目录名覆盖。
    #[serde(default)]
    pub key: String,
    /// 协议插件名（modbus / bacnet / mqtt / http_client / http_server / tcp_server）。
    pub protocol_name: String,
    /// 连接定义：connectionKey → 协议相关配置。
    #[serde(default)]
    pub connections: BTreeMap<String, Value>,
    #[serde(default)]
    pub device_models: Vec<DeviceModel>,
    #[serde(default)]
    pub tasks: Vec<TimerTask>,
}

impl DeviceConfig {
    /// 遍历配置内全部设备（附带所属物模型）。
    pub fn devices(&self) -> impl Iterator<Item = (&DeviceModel, &Device)> {
        self.device_models
            .iter()
            .flat_map(|model| model.devices.iter().map(move |device| (model, device)))
    }
}

/// 物模型：一类设备共享的点位定义。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModel {
    pub name: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub device_points: Vec<Point>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl DeviceModel {
    pub fn point(&self, name: &str) -> Option<&Point> {
        self.device_points.iter().find(|p| p.name == name)
    }
}

/// 物模型上的点位。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub value_type: ValueType,
    pub read_write: ReadWrite,
    #[serde(default)]
    pub default_value: String,
    #[serde(default)]
    pub report_mode: ReportMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// 周期上报间隔（仅 `reportMode = periodic`），如 "30s"。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_report: Option<String>,
    /// 协议扩展属性（Modbus 寄存器、BACnet 对象等）。
    #[serde(default)]
    pub extends: Map<String, Value>,
}

/// 设备实例。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(alias = "id")]
    pub device_sn: String,
    pub model_name: String,
    #[serde(default)]
    pub description: String,
    pub connection_key: String,
    /// 协议寻址属性（unitID、ip、id、ttl 等）。
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// 点位语义类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
    String,
    Bool,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::Bool => "bool",
        }
    }
}

/// 点位读写属性。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadWrite {
    R,
    W,
    RW,
}

impl ReadWrite {
    pub fn readable(&self) -> bool {
        matches!(self, ReadWrite::R | ReadWrite::RW)
    }

    pub fn writable(&self) -> bool {
        matches!(self, ReadWrite::W | ReadWrite::RW)
    }
}

/// 上报模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportMode {
    #[default]
    #[serde(alias = "realTime")]
    Real,
    Change,
    Periodic,
}

/// 定时任务。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerTask {
    #[serde(rename = "type")]
    pub task_type: TimerTaskType,
    /// 毫秒数字符串。
    pub interval: String,
    #[serde(default)]
    pub action: Value,
}

impl TimerTask {
    pub fn interval_ms(&self) -> Option<u64> {
        self.interval.trim().parse().ok()
    }

    /// 解析 `read_points` 任务的动作列表。
    pub fn read_points_actions(&self) -> Result<Vec<ReadPointsAction>, serde_json::Error> {
        serde_json::from_value(self.action.clone())
    }

    /// 解析 `script` 任务要调用的函数名。
    pub fn script_function(&self) -> Option<&str> {
        self.action.as_str().filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerTaskType {
    ReadPoints,
    Script,
}

/// `read_points` 的单条动作。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPointsAction {
    #[serde(alias = "devices")]
    pub device_sns: Vec<String>,
    #[serde(alias = "points")]
    pub point_names: Vec<String>,
}
