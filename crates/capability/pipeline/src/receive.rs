use std::sync::Arc;

use async_trait::async_trait;
use domain::{DeviceData, PointReport, PointValueData, ReportValue};
use gw_protocol::{ReceiveHandler, Registry};
use gw_storage::DeviceShadow;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{PipelineError, Publisher};

/// 唯一的接收流水线实现。
///
/// 同一帧内点位顺序保持不变；影子接受顺序与上报顺序一致。
pub struct ReceivePipeline {
    registry: Arc<Registry>,
    shadow: DeviceShadow,
    publisher: Arc<dyn Publisher>,
    /// 串行化 “写影子 + 上报”，保证同一设备的上报顺序
    order: Mutex<()>,
}

impl ReceivePipeline {
    pub fn new(registry: Arc<Registry>, shadow: DeviceShadow, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            registry,
            shadow,
            publisher,
            order: Mutex::new(()),
        }
    }

    pub fn shadow(&self) -> &DeviceShadow {
        &self.shadow
    }

    /// 处理一批入站数据，返回实际上报的点位数。
    pub async fn process(&self, data: Vec<DeviceData>) -> Result<usize, PipelineError> {
        let _order = self.order.lock().await;
        let mut published = 0;
        for frame in data {
            gw_telemetry::record_points_received(frame.values.len() as u64);
            let accepted = self.accept(&frame);
            if accepted.is_empty() {
                continue;
            }
            let count = accepted.len();
            self.publisher
                .publish(PointReport::new(frame.device_sn, accepted))
                .await?;
            gw_telemetry::record_points_published(count as u64);
            published += count;
        }
        Ok(published)
    }

    fn accept(&self, frame: &DeviceData) -> Vec<ReportValue> {
        let sn = frame.device_sn.as_str();
        let mut accepted = Vec::with_capacity(frame.values.len());
        for pd in &frame.values {
            let Some(point) = self.registry.point_by_device(sn, &pd.point_name) else {
                gw_telemetry::record_dropped_unknown();
                warn!(target: "gw.pipeline", device_sn = %sn, point = %pd.point_name, "unknown point, value dropped");
                continue;
            };
            let value = match PointValueData::coerce(&pd.value, point.value_type) {
                Ok(value) => value,
                Err(e) => {
                    gw_telemetry::record_dropped_conversion();
                    warn!(target: "gw.pipeline", device_sn = %sn, point = %pd.point_name, error = %e, "conversion failed, value dropped");
                    continue;
                }
            };
            match self.shadow.set_point_if_changed(sn, &point.name, value.clone()) {
                Ok(true) => accepted.push(ReportValue {
                    point_name: point.name,
                    value_type: point.value_type,
                    value,
                }),
                Ok(false) => {
                    gw_telemetry::record_dropped_unchanged();
                    debug!(target: "gw.pipeline", device_sn = %sn, point = %pd.point_name, "unchanged");
                }
                Err(e) => {
                    warn!(target: "gw.pipeline", device_sn = %sn, point = %pd.point_name, error = %e, "shadow rejected value");
                }
            }
        }
        accepted
    }

    /// 不经变化检测，重发影子中的当前值（周期上报）。
    pub async fn republish(&self, device_sn: &str, point_names: &[String]) -> Result<usize, PipelineError> {
        let values: Vec<ReportValue> = point_names
            .iter()
            .filter_map(|name| {
                let point = self.registry.point_by_device(device_sn, name)?;
                let value = self.shadow.get_point(device_sn, name)?;
                Some(ReportValue {
                    point_name: point.name,
                    value_type: point.value_type,
                    value,
                })
            })
            .collect();
        if values.is_empty() {
            return Ok(0);
        }
        let count = values.len();
        let _order = self.order.lock().await;
        self.publisher
            .publish(PointReport::new(device_sn, values))
            .await?;
        gw_telemetry::record_points_published(count as u64);
        Ok(count)
    }

    /// 消费脚本 `publish` 通道，直到发送端全部关闭。
    pub fn spawn_script_drain(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<DeviceData>) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                pipeline.handle(vec![data]).await;
            }
        })
    }
}

#[async_trait]
impl ReceiveHandler for ReceivePipeline {
    async fn handle(&self, data: Vec<DeviceData>) {
        if let Err(e) = self.process(data).await {
            warn!(target: "gw.pipeline", error = %e, "report not delivered");
        }
    }
}
