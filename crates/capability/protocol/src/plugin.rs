//! 协议插件契约。
//!
//! ```text
//! Plugin ── protocol_adapter() ──► ProtocolAdapter (encode / decode)
//!    │
//!    └── connector(device_sn) ──► Connector (send / release，独占租约)
//!
//! 入站数据 ──► ProtocolAdapter::decode ──► ReceiveHandler::handle（接收流水线）
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use domain::{DeviceConfig, DeviceData, EncodeMode, PointData};
use gw_script::ScriptSandbox;
use gw_storage::{CoreCache, DeviceShadow};
use serde_json::Value;

use crate::bacnet::BacnetCommand;
use crate::error::ProtocolError;
use crate::modbus::ModbusCommand;

/// 运行期注册表：登记的插件类型为 `dyn Plugin`。
pub type Registry = CoreCache<dyn Plugin>;

/// 适配器编码结果，由同一插件的连接器发送。
#[derive(Debug, Clone)]
pub enum Frame {
    Modbus(ModbusCommand),
    Bacnet(BacnetCommand),
    /// MQTT `{topic, payload}` 或 HTTP 请求描述
    Payload(Value),
}

/// 每个驱动目录一份的编解码器。
pub trait ProtocolAdapter: Send + Sync {
    fn encode(
        &self,
        device_sn: &str,
        mode: EncodeMode,
        points: &[PointData],
    ) -> Result<Frame, ProtocolError>;

    fn decode(&self, raw: &str) -> Result<Vec<DeviceData>, ProtocolError>;
}

/// 单个连接的独占租约。
#[async_trait]
pub trait Connector: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), ProtocolError>;

    /// 归还租约；连接本身保持打开。
    fn release(self: Box<Self>) {}
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn protocol_name(&self) -> &'static str;

    fn protocol_adapter(&self) -> Arc<dyn ProtocolAdapter>;

    /// 返回设备 `connectionKey` 对应的连接；租约被占用时等待。
    async fn connector(&self, device_sn: &str) -> Result<Box<dyn Connector>, ProtocolError>;

    /// 停止后台任务、关闭连接与监听。
    async fn destroy(&self) -> Result<(), ProtocolError>;
}

/// 入站数据出口（接收流水线）。
#[async_trait]
pub trait ReceiveHandler: Send + Sync {
    async fn handle(&self, data: Vec<DeviceData>);
}

/// 插件初始化所需的全部依赖。
#[derive(Clone)]
pub struct PluginContext {
    pub config: Arc<DeviceConfig>,
    pub registry: Arc<Registry>,
    pub shadow: DeviceShadow,
    pub script: Option<Arc<ScriptSandbox>>,
    pub on_receive: Arc<dyn ReceiveHandler>,
    /// 全局虚拟模式（所有连接走脚本 mockRead/mockWrite）
    pub virtual_mode: bool,
}

impl PluginContext {
    pub fn key(&self) -> &str {
        &self.config.key
    }

    /// 脚本是否定义了指定函数。
    pub fn script_has(&self, name: &str) -> bool {
        self.script
            .as_ref()
            .map(|s| s.has_function(name))
            .unwrap_or(false)
    }

    /// 解码原始帧并交给接收流水线；失败仅记录日志。
    pub async fn forward(&self, adapter: &dyn ProtocolAdapter, raw: &str) {
        forward_decoded(self.key(), adapter, self.on_receive.as_ref(), raw).await;
    }
}

pub(crate) async fn forward_decoded(
    key: &str,
    adapter: &dyn ProtocolAdapter,
    on_receive: &dyn ReceiveHandler,
    raw: &str,
) {
    match adapter.decode(raw) {
        Ok(data) if !data.is_empty() => on_receive.handle(data).await,
        Ok(_) => {}
        Err(e) => {
            if matches!(e, ProtocolError::Script(_)) {
                gw_telemetry::record_script_failure();
            }
            tracing::warn!(target: "gw.protocol", key, error = %e, "decode failed, frame dropped");
        }
    }
}

/// 只经脚本编解码的适配器（MQTT、HTTP、TCP）。
///
/// 解码优先调用脚本 `decode`；未定义时按 `[{deviceSn, values}]` 解析原始帧。
pub struct ScriptAdapter {
    key: String,
    protocol: &'static str,
    script: Option<Arc<ScriptSandbox>>,
    encoder: Option<fn(&ScriptAdapter, &str, EncodeMode, &[PointData]) -> Result<Frame, ProtocolError>>,
}

impl ScriptAdapter {
    /// 不支持下发的监听型插件。
    pub fn listener(key: &str, protocol: &'static str, script: Option<Arc<ScriptSandbox>>) -> Self {
        Self {
            key: key.to_string(),
            protocol,
            script,
            encoder: None,
        }
    }

    pub fn with_encoder(
        key: &str,
        protocol: &'static str,
        script: Option<Arc<ScriptSandbox>>,
        encoder: fn(&ScriptAdapter, &str, EncodeMode, &[PointData]) -> Result<Frame, ProtocolError>,
    ) -> Self {
        Self {
            key: key.to_string(),
            protocol,
            script,
            encoder: Some(encoder),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// 调用脚本 `encode`；脚本未定义时返回 `None`。
    pub fn script_encode(&self, device_sn: &str, payload: &Value) -> Result<Option<Value>, ProtocolError> {
        match self.script.as_ref().filter(|s| s.has_function("encode")) {
            Some(script) => Ok(Some(script.encode(device_sn, payload)?)),
            None => Ok(None),
        }
    }
}

impl ProtocolAdapter for ScriptAdapter {
    fn encode(
        &self,
        device_sn: &str,
        mode: EncodeMode,
        points: &[PointData],
    ) -> Result<Frame, ProtocolError> {
        match self.encoder {
            Some(encoder) => encoder(self, device_sn, mode, points),
            None => Err(ProtocolError::UnsupportedOperation(format!(
                "{} does not support encode",
                self.protocol
            ))),
        }
    }

    fn decode(&self, raw: &str) -> Result<Vec<DeviceData>, ProtocolError> {
        if let Some(script) = self.script.as_ref().filter(|s| s.has_function("decode")) {
            return Ok(script.decode(raw)?);
        }
        serde_json::from_str(raw).map_err(|e| {
            ProtocolError::Decode(format!("{}: no decode script and frame is not device data: {e}", self.key))
        })
    }
}

/// 监听型插件的连接器：不支持下发。
pub(crate) struct ListenerConnector {
    pub protocol: &'static str,
}

#[async_trait]
impl Connector for ListenerConnector {
    async fn send(&mut self, _frame: Frame) -> Result<(), ProtocolError> {
        Err(ProtocolError::UnsupportedOperation(format!(
            "{} connector does not send",
            self.protocol
        )))
    }
}
