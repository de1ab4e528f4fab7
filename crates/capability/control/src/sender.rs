use std::sync::Arc;

use domain::{EncodeMode, PointData};
use gw_protocol::{ProtocolError, Registry};
use gw_storage::DeviceShadow;
use tracing::{debug, warn};

use crate::ControlError;

/// 单次下发：查插件 → 取连接租约 → 编码 → 发送 → 归还租约。
///
/// 传输失败时调用影子的 `may_be_offline`。
#[derive(Clone)]
pub struct DeviceSender {
    registry: Arc<Registry>,
    shadow: DeviceShadow,
}

impl DeviceSender {
    pub fn new(registry: Arc<Registry>, shadow: DeviceShadow) -> Self {
        Self { registry, shadow }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn shadow(&self) -> &DeviceShadow {
        &self.shadow
    }

    pub async fn send(
        &self,
        device_sn: &str,
        mode: EncodeMode,
        points: &[PointData],
    ) -> Result<(), ControlError> {
        let plugin = self
            .registry
            .plugin(device_sn)
            .ok_or_else(|| ControlError::NotFound(format!("plugin for device {device_sn}")))?;
        let result = match plugin.connector(device_sn).await {
            Ok(mut connector) => {
                let sent = match plugin.protocol_adapter().encode(device_sn, mode, points) {
                    Ok(frame) => connector.send(frame).await,
                    Err(e) => Err(e),
                };
                connector.release();
                sent
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                gw_telemetry::record_send_success();
                debug!(target: "gw.control", device_sn, ?mode, points = points.len(), "sent");
                Ok(())
            }
            Err(e) => {
                gw_telemetry::record_send_failure();
                self.on_failure(device_sn, &e);
                Err(e.into())
            }
        }
    }

    fn on_failure(&self, device_sn: &str, error: &ProtocolError) {
        warn!(target: "gw.control", device_sn, error = %error, "send failed");
        if error.is_transport()
            && let Err(e) = self.shadow.may_be_offline(device_sn)
        {
            debug!(target: "gw.control", device_sn, error = %e, "may_be_offline skipped");
        }
    }
}
