//! # 控制能力模块
//!
//! - [`DeviceSender`]：插件 → 连接器租约 → 编码 → 发送 → 归还租约
//! - [`CommandDispatcher`]：上游点位读写入口（REST、MQTT 命令）
//! - [`Scheduler`]：`timerTasks`（read_points / script）与周期上报
//! - [`MqttBridge`]：上行数据/事件发布与命令订阅

mod bridge;
mod dispatcher;
mod scheduler;
mod sender;

use gw_protocol::ProtocolError;

pub use bridge::{MqttBridge, MqttBridgeConfig, command_sn};
pub use dispatcher::{CommandDispatcher, CommandPoint, CommandTarget, DeviceCommand};
pub use scheduler::{MIN_TASK_INTERVAL, Scheduler};
pub use sender::DeviceSender;

/// 控制链路错误。
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid task: {0}")]
    Config(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("mqtt error: {0}")]
    Mqtt(String),
}
