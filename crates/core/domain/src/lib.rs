//! 网关领域模型。
//!
//! - `config`：驱动配置树（物模型 → 设备 → 点位，定时任务）
//! - `data`：点位值、设备数据帧、编码模式
//! - `report`：上行上报记录与设备事件

pub mod config;
pub mod data;
pub mod report;

pub use config::{
    Device, DeviceConfig, DeviceModel, Point, ReadPointsAction, ReadWrite, ReportMode, TimerTask,
    TimerTaskType, ValueType,
};
pub use data::{DeviceData, EncodeMode, PointData, PointValueData, ValueError};
pub use report::{DeviceEvent, DeviceEventData, OnlineState, PointReport, ReportValue};

/// 当前 Unix 毫秒时间戳。
pub fn now_epoch_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
