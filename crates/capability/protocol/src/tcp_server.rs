//! TCP Server 插件
//!
//! 监听 TCP 端口，每次读到的数据编码为 `{raw, hex, remote}` 交给脚本 `decode`。
//!
//! ## 配置示例
//!
//! ```json
//! { "host": "0.0.0.0", "port": 9000, "buffSize": 1024 }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::error::ProtocolError;
use crate::plugin::{
    Connector, ListenerConnector, Plugin, PluginContext, ProtocolAdapter, ReceiveHandler,
    ScriptAdapter, forward_decoded,
};
use crate::types::{TaskSet, connection_config, to_hex};

/// TCP 服务器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 单次读取缓冲区大小
    #[serde(default = "default_buff_size", alias = "buff_size")]
    pub buff_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_buff_size() -> usize {
    1024
}

/// 一次读取的帧。
pub fn frame_of(bytes: &[u8], remote: &SocketAddr) -> String {
    json!({
        "raw": String::from_utf8_lossy(bytes),
        "hex": to_hex(bytes),
        "remote": remote.to_string(),
    })
    .to_string()
}

struct Listener {
    key: String,
    adapter: Arc<ScriptAdapter>,
    on_receive: Arc<dyn ReceiveHandler>,
    buff_size: usize,
    connections: Arc<TaskSet>,
}

impl Listener {
    async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!(target: "gw.tcp", key = %self.key, %peer, "tcp connection accepted");
                    let this = self.clone();
                    self.connections
                        .push(tokio::spawn(async move { this.handle_connection(stream, peer).await }));
                }
                Err(e) => {
                    error!(target: "gw.tcp", key = %self.key, error = %e, "failed to accept connection");
                }
            }
        }
    }

    /// 处理单个连接
    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let mut buf = vec![0u8; self.buff_size.max(1)];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => {
                    info!(target: "gw.tcp", key = %self.key, %peer, "connection closed by peer");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(target: "gw.tcp", key = %self.key, %peer, error = %e, "tcp read failed");
                    return;
                }
            };
            let raw = frame_of(&buf[..n], &peer);
            forward_decoded(&self.key, self.adapter.as_ref(), self.on_receive.as_ref(), &raw).await;
        }
    }
}

/// TCP Server 插件：每个 connectionKey 一个监听端口。
pub struct TcpServerPlugin {
    key: String,
    adapter: Arc<ScriptAdapter>,
    local_addrs: HashMap<String, SocketAddr>,
    tasks: TaskSet,
    connections: Arc<TaskSet>,
}

impl TcpServerPlugin {
    pub async fn initialize(ctx: &PluginContext) -> Result<Self, ProtocolError> {
        let adapter = Arc::new(ScriptAdapter::listener(
            ctx.key(),
            "tcp_server",
            ctx.script.clone(),
        ));
        let tasks = TaskSet::new();
        let connections = Arc::new(TaskSet::new());
        let mut local_addrs = HashMap::new();
        for (key, raw) in &ctx.config.connections {
            let config: TcpServerConfig = connection_config(key, raw)?;
            let listener = TcpListener::bind((config.host.as_str(), config.port))
                .await
                .map_err(|e| {
                    ProtocolError::Config(format!(
                        "connection {key}: bind {}:{}: {e}",
                        config.host, config.port
                    ))
                })?;
            let addr = listener.local_addr()?;
            info!(target: "gw.tcp", key = %ctx.key(), connection = %key, %addr, "tcp server listening");
            let state = Arc::new(Listener {
                key: ctx.key().to_string(),
                adapter: adapter.clone(),
                on_receive: ctx.on_receive.clone(),
                buff_size: config.buff_size,
                connections: connections.clone(),
            });
            tasks.push(tokio::spawn(state.run(listener)));
            local_addrs.insert(key.clone(), addr);
        }
        Ok(Self {
            key: ctx.key().to_string(),
            adapter,
            local_addrs,
            tasks,
            connections,
        })
    }

    pub fn local_addr(&self, connection_key: &str) -> Option<SocketAddr> {
        self.local_addrs.get(connection_key).copied()
    }
}

#[async_trait]
impl Plugin for TcpServerPlugin {
    fn protocol_name(&self) -> &'static str {
        "tcp_server"
    }

    fn protocol_adapter(&self) -> Arc<dyn ProtocolAdapter> {
        self.adapter.clone()
    }

    async fn connector(&self, _device_sn: &str) -> Result<Box<dyn Connector>, ProtocolError> {
        Ok(Box::new(ListenerConnector {
            protocol: "tcp_server",
        }))
    }

    async fn destroy(&self) -> Result<(), ProtocolError> {
        self.tasks.abort_all();
        self.connections.abort_all();
        info!(target: "gw.tcp", key = %self.key, "tcp server plugin destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config: TcpServerConfig =
            serde_json::from_value(json!({"port": 9000})).expect("config");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.buff_size, 1024);
        let config: TcpServerConfig =
            serde_json::from_value(json!({"port": 9001, "buffSize": 16})).expect("config");
        assert_eq!(config.buff_size, 16);
    }

    #[test]
    fn test_frame_carries_raw_and_hex() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().expect("addr");
        let frame: serde_json::Value =
            serde_json::from_str(&frame_of(b"A1", &peer)).expect("json");
        assert_eq!(frame["raw"], json!("A1"));
        assert_eq!(frame["hex"], json!("4131"));
        assert_eq!(frame["remote"], json!("127.0.0.1:4000"));
    }
}
