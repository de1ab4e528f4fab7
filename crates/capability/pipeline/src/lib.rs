//! # 数据接收流水线
//!
//! 所有插件解码出的 [`DeviceData`](domain::DeviceData) 以及脚本 `publish` 的数据都经由
//! [`ReceivePipeline`] 进入网关：
//!
//! ```text
//! DeviceData ─► 注册表查点位 ─► 按 valueType 转换 ─► 影子变化检测 ─► 按设备聚合 ─► Publisher
//! ```
//!
//! 设备上下线边沿由影子回调触发，经 [`spawn_notifier`] 异步投递到 [`NotificationSink`]。

mod notify;
mod receive;

use async_trait::async_trait;
use domain::{DeviceEvent, PointReport};
use tracing::info;

pub use notify::spawn_notifier;
pub use receive::ReceivePipeline;

/// 流水线错误。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("notify failed: {0}")]
    Notify(String),
}

/// 上行点位出口。
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, report: PointReport) -> Result<(), PipelineError>;
}

/// 上下线事件出口。
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: DeviceEvent) -> Result<(), PipelineError>;
}

/// 仅写日志的上报器（未启用上行桥接时使用）。
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, report: PointReport) -> Result<(), PipelineError> {
        let payload = serde_json::to_string(&report)
            .map_err(|e| PipelineError::Publish(e.to_string()))?;
        info!(target: "gw.pipeline", device_sn = %report.device_sn, %payload, "point report");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, event: DeviceEvent) -> Result<(), PipelineError> {
        let payload = serde_json::to_string(&event)
            .map_err(|e| PipelineError::Notify(e.to_string()))?;
        info!(target: "gw.pipeline", device_sn = %event.event_data.device_sn, %payload, "device event");
        Ok(())
    }
}
