//! 协议名 → 插件构造。

use std::sync::Arc;

use tracing::info;

use crate::bacnet::BacnetPlugin;
use crate::error::ProtocolError;
use crate::http_client::HttpClientPlugin;
use crate::http_server::HttpServerPlugin;
use crate::modbus::ModbusPlugin;
use crate::mqtt::MqttPlugin;
use crate::plugin::{Plugin, PluginContext};
use crate::tcp_server::TcpServerPlugin;

/// 已支持的协议名（含别名）。
pub const PROTOCOL_NAMES: &[&str] = &[
    "modbus",
    "bacnet",
    "mqtt",
    "http_client",
    "httpclient",
    "http_server",
    "httpserver",
    "tcp_server",
    "tcpserver",
];

pub fn is_known_protocol(name: &str) -> bool {
    PROTOCOL_NAMES.contains(&name)
}

/// 按驱动目录的 `protocolName` 初始化插件（启动采集任务与监听）。
pub async fn initialize_plugin(ctx: &PluginContext) -> Result<Arc<dyn Plugin>, ProtocolError> {
    let plugin: Arc<dyn Plugin> = match ctx.config.protocol_name.as_str() {
        "modbus" => Arc::new(ModbusPlugin::initialize(ctx)?),
        "bacnet" => Arc::new(BacnetPlugin::initialize(ctx).await?),
        "mqtt" => Arc::new(MqttPlugin::initialize(ctx)?),
        "http_client" | "httpclient" => Arc::new(HttpClientPlugin::initialize(ctx)?),
        "http_server" | "httpserver" => Arc::new(HttpServerPlugin::initialize(ctx).await?),
        "tcp_server" | "tcpserver" => Arc::new(TcpServerPlugin::initialize(ctx).await?),
        other => {
            return Err(ProtocolError::Config(format!(
                "{}: unknown protocol {other}",
                ctx.key()
            )));
        }
    };
    info!(
        target: "gw.protocol",
        key = %ctx.key(),
        protocol = plugin.protocol_name(),
        connections = ctx.config.connections.len(),
        "plugin initialized"
    );
    Ok(plugin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_protocols() {
        assert!(is_known_protocol("modbus"));
        assert!(is_known_protocol("httpserver"));
        assert!(!is_known_protocol("dlt645"));
    }
}
