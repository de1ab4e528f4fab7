//! 上行 MQTT 桥接。
//!
//! | 方向 | 主题 | 载荷 |
//! |---|---|---|
//! | 上报 | `<prefix>/data/<deviceSn>` | `PointReport` |
//! | 事件 | `<prefix>/event` | `DeviceEvent` |
//! | 命令 | `<prefix>/command/<deviceSn>` | `DeviceCommand` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{DeviceEvent, PointReport};
use gw_pipeline::{NotificationSink, PipelineError, Publisher};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ControlError;
use crate::dispatcher::{CommandTarget, DeviceCommand};

#[derive(Debug, Clone)]
pub struct MqttBridgeConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub topic_prefix: String,
}

#[derive(Clone)]
pub struct MqttBridge {
    client: AsyncClient,
    prefix: String,
}

impl MqttBridge {
    /// 建立连接并启动事件循环；命令交给 `target` 执行。
    pub fn connect(
        config: MqttBridgeConfig,
        target: Arc<dyn CommandTarget>,
    ) -> Result<(Self, JoinHandle<()>), ControlError> {
        let prefix = config.topic_prefix.trim_end_matches('/').to_string();
        if prefix.is_empty() {
            return Err(ControlError::Config("mqtt topic prefix is empty".to_string()));
        }
        let mut options = MqttOptions::new(config.client_id, config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (config.username, config.password) {
            options.set_credentials(username, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let command_filter = format!("{prefix}/command/+");
        let loop_client = client.clone();
        let loop_prefix = prefix.clone();
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // 每次重连后重新订阅
                        if let Err(e) = loop_client.subscribe(command_filter.clone(), QoS::AtLeastOnce).await {
                            warn!(target: "gw.control", error = %e, "command subscribe failed");
                        } else {
                            info!(target: "gw.control", topic = %command_filter, "bridge connected");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(device_sn) = command_sn(&loop_prefix, &publish.topic) else {
                            continue;
                        };
                        let command: DeviceCommand = match serde_json::from_slice(&publish.payload) {
                            Ok(command) => command,
                            Err(e) => {
                                warn!(target: "gw.control", device_sn = %device_sn, error = %e, "command payload invalid");
                                continue;
                            }
                        };
                        let target = target.clone();
                        tokio::spawn(async move {
                            match target.execute(&device_sn, command).await {
                                Ok(()) => info!(target: "gw.control", device_sn = %device_sn, "command executed"),
                                Err(e) => warn!(target: "gw.control", device_sn = %device_sn, error = %e, "command failed"),
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(target: "gw.control", error = %e, "mqtt bridge eventloop error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        Ok((Self { client, prefix }, handle))
    }

    pub fn data_topic(&self, device_sn: &str) -> String {
        format!("{}/data/{device_sn}", self.prefix)
    }

    pub fn event_topic(&self) -> String {
        format!("{}/event", self.prefix)
    }
}

/// 从命令主题中取出设备 SN。
pub fn command_sn(prefix: &str, topic: &str) -> Option<String> {
    let rest = topic.strip_prefix(prefix.trim_end_matches('/'))?;
    let sn = rest.strip_prefix("/command/")?;
    (!sn.is_empty() && !sn.contains('/')).then(|| sn.to_string())
}

#[async_trait]
impl Publisher for MqttBridge {
    async fn publish(&self, report: PointReport) -> Result<(), PipelineError> {
        let payload = serde_json::to_vec(&report).map_err(|e| PipelineError::Publish(e.to_string()))?;
        self.client
            .publish(self.data_topic(&report.device_sn), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| PipelineError::Publish(e.to_string()))
    }
}

#[async_trait]
impl NotificationSink for MqttBridge {
    async fn notify(&self, event: DeviceEvent) -> Result<(), PipelineError> {
        let payload = serde_json::to_vec(&event).map_err(|e| PipelineError::Notify(e.to_string()))?;
        self.client
            .publish(self.event_topic(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| PipelineError::Notify(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::EncodeMode;

    #[test]
    fn command_topic_yields_device_sn() {
        assert_eq!(command_sn("driverbox", "driverbox/command/m-1"), Some("m-1".to_string()));
        assert_eq!(command_sn("driverbox/", "driverbox/command/m-1"), Some("m-1".to_string()));
        assert_eq!(command_sn("driverbox", "driverbox/data/m-1"), None);
        assert_eq!(command_sn("driverbox", "driverbox/command/"), None);
        assert_eq!(command_sn("driverbox", "other/command/m-1"), None);
    }

    #[test]
    fn command_payload_parses() {
        let command: DeviceCommand = serde_json::from_str(
            r#"{"mode":"write","points":[{"pointName":"onOff","value":1},{"pointName":"mode"}]}"#,
        )
        .expect("command");
        assert_eq!(command.mode, EncodeMode::Write);
        assert_eq!(command.points.len(), 2);
        assert_eq!(command.points[1].value, None);
    }
}
