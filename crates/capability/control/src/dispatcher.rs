use async_trait::async_trait;
use domain::{EncodeMode, PointData, PointValueData};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::ControlError;
use crate::sender::DeviceSender;

/// 上游点位读写请求中的单个点位。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPoint {
    pub point_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// MQTT 命令载荷：`{"mode":"read|write","points":[...]}`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub mode: EncodeMode,
    pub points: Vec<CommandPoint>,
}

/// 命令执行入口。网关以此在配置重载后切换到新周期的调度器。
#[async_trait]
pub trait CommandTarget: Send + Sync {
    async fn execute(&self, device_sn: &str, command: DeviceCommand) -> Result<(), ControlError>;
}

#[derive(Clone)]
pub struct CommandDispatcher {
    sender: DeviceSender,
}

impl CommandDispatcher {
    pub fn new(sender: DeviceSender) -> Self {
        Self { sender }
    }

    /// 逐点读取；任一点位失败即中止。
    pub async fn handle_read(&self, device_sn: &str, point_names: &[String]) -> Result<(), ControlError> {
        self.ensure_device(device_sn)?;
        for name in point_names {
            if self.sender.registry().point_by_device(device_sn, name).is_none() {
                return Err(ControlError::NotFound(format!("point {name} on device {device_sn}")));
            }
        }
        for name in point_names {
            self.sender
                .send(device_sn, EncodeMode::Read, &[PointData::new(name.clone(), Value::Null)])
                .await?;
        }
        Ok(())
    }

    /// 点位与取值按位置配对后逐点写入，成功后记入影子写入值缓存。
    pub async fn handle_write(
        &self,
        device_sn: &str,
        point_names: &[String],
        values: &[Value],
    ) -> Result<(), ControlError> {
        if point_names.len() != values.len() {
            return Err(ControlError::BadRequest(format!(
                "{} points but {} values",
                point_names.len(),
                values.len()
            )));
        }
        self.ensure_device(device_sn)?;
        let mut outgoing = Vec::with_capacity(values.len());
        for (name, value) in point_names.iter().zip(values) {
            let point = self
                .sender
                .registry()
                .point_by_device(device_sn, name)
                .ok_or_else(|| ControlError::NotFound(format!("point {name} on device {device_sn}")))?;
            let item = match command_target(value) {
                // 写命令对象交由协议适配器解析，只缓存能转换的目标值
                Some(target) => (value.clone(), PointValueData::coerce(&target, point.value_type).ok()),
                None => {
                    let typed = PointValueData::coerce(value, point.value_type)
                        .map_err(|e| ControlError::BadRequest(format!("{name}: {e}")))?;
                    (typed.to_json(), Some(typed))
                }
            };
            outgoing.push(item);
        }
        for (name, (value, cached)) in point_names.iter().zip(outgoing) {
            self.sender
                .send(device_sn, EncodeMode::Write, &[PointData::new(name.clone(), value.clone())])
                .await?;
            info!(target: "gw.control", device_sn, point = %name, value = %value, "point written");
            // 设备已在注册表中确认存在，影子缺失时忽略写入缓存
            if let Some(cached) = cached {
                let _ = self.sender.shadow().set_write_point_value(device_sn, name, cached);
            }
        }
        Ok(())
    }

    fn ensure_device(&self, device_sn: &str) -> Result<(), ControlError> {
        if self.sender.registry().device(device_sn).is_none() {
            return Err(ControlError::NotFound(format!("device {device_sn}")));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandTarget for CommandDispatcher {
    async fn execute(&self, device_sn: &str, command: DeviceCommand) -> Result<(), ControlError> {
        let names: Vec<String> = command.points.iter().map(|p| p.point_name.clone()).collect();
        match command.mode {
            EncodeMode::Read => self.handle_read(device_sn, &names).await,
            EncodeMode::Write => {
                let values: Vec<Value> = command.points.into_iter().filter_map(|p| p.value).collect();
                self.handle_write(device_sn, &names, &values).await
            }
        }
    }
}

/// 带参数的写命令（`{"value": .., "priority": .., "preOp": [..]}`，或其 JSON 字符串）中的目标值。
fn command_target(value: &Value) -> Option<Value> {
    match value {
        Value::Object(map) => map.get("value").cloned(),
        Value::String(s) if s.trim_start().starts_with('{') => {
            serde_json::from_str::<Value>(s).ok()?.get("value").cloned()
        }
        _ => None,
    }
}
