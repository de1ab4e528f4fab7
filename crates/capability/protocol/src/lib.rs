//! # 协议插件能力模块
//!
//! 每个驱动目录（connector key）对应一个插件实例，插件按 `connectionKey` 维护连接池：
//! - **Modbus**：TCP / RTU over TCP，寄存器区间合并读、掩码与位域写
//! - **BACnet/IP**：ReadPropertyMultiple 批量采集、WriteProperty 与回读
//! - **MQTT**：订阅上报、脚本编码下发
//! - **HTTP Client**：一次点位读写对应一次 HTTP 请求
//! - **HTTP Server / TCP Server**：监听上报，仅支持解码
//!
//! ## 数据流
//!
//! ```text
//! 下发：Command Dispatcher ─► Plugin::connector(sn) ─► ProtocolAdapter::encode ─► Connector::send
//!
//! 上报：网络 / 周期采集 ─► ProtocolAdapter::decode ─► ReceiveHandler（接收流水线）
//! ```
//!
//! ## 驱动目录配置
//!
//! ```json
//! {
//!   "protocolName": "modbus",
//!   "connections": { "conn-1": { "address": "127.0.0.1:502", "mode": "tcp" } },
//!   "deviceModels": [ ... ]
//! }
//! ```

pub mod bacnet;
mod error;
pub mod http_client;
pub mod http_server;
mod manager;
pub mod modbus;
pub mod mqtt;
mod plugin;
pub mod tcp_server;
mod types;

pub use error::ProtocolError;
pub use http_client::HttpClientPlugin;
pub use http_server::HttpServerPlugin;
pub use manager::{PROTOCOL_NAMES, initialize_plugin, is_known_protocol};
pub use mqtt::MqttPlugin;
pub use plugin::{
    Connector, Frame, Plugin, PluginContext, ProtocolAdapter, ReceiveHandler, Registry,
    ScriptAdapter,
};
pub use tcp_server::TcpServerPlugin;
pub use types::*;
