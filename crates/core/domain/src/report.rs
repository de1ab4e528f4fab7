//! 上行记录：点位上报与设备上下线事件。

use serde::{Deserialize, Serialize};

use crate::config::ValueType;
use crate::data::PointValueData;

pub const DEFAULT_SOURCE_NAME: &str = "default";
pub const DEVICE_EVENT_TYPE: &str = "DeviceEvent";

/// 一台设备一次被接受的点位值集合。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointReport {
    pub device_sn: String,
    pub source_name: String,
    pub values: Vec<ReportValue>,
}

impl PointReport {
    pub fn new(device_sn: impl Into<String>, values: Vec<ReportValue>) -> Self {
        Self {
            device_sn: device_sn.into(),
            source_name: DEFAULT_SOURCE_NAME.to_string(),
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportValue {
    pub point_name: String,
    pub value_type: ValueType,
    pub value: PointValueData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnlineState {
    Online,
    Offline,
}

impl From<bool> for OnlineState {
    fn from(online: bool) -> Self {
        if online {
            OnlineState::Online
        } else {
            OnlineState::Offline
        }
    }
}

/// 设备上下线通知。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub event_type: String,
    pub report_timestamp: i64,
    pub event_data: DeviceEventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEventData {
    #[serde(rename = "deviceSN")]
    pub device_sn: String,
    #[serde(rename = "type")]
    pub state: OnlineState,
}

impl DeviceEvent {
    pub fn online_change(device_sn: impl Into<String>, online: bool, ts_ms: i64) -> Self {
        Self {
            event_type: DEVICE_EVENT_TYPE.to_string(),
            report_timestamp: ts_ms,
            event_data: DeviceEventData {
                device_sn: device_sn.into(),
                state: online.into(),
            },
        }
    }
}
