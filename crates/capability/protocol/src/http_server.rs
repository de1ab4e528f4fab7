//! HTTP Server 插件：任意路径的请求转换为 `{path, method, body}` 交给脚本 `decode`。
//!
//! 成功应答 `{"code":0,"message":"ok"}`，解码失败应答 500 `{"code":-1,"message":...}`。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::plugin::{
    Connector, ListenerConnector, Plugin, PluginContext, ProtocolAdapter, ReceiveHandler,
    ScriptAdapter,
};
use crate::types::{TaskSet, connection_config};

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Clone)]
struct ServerState {
    key: Arc<str>,
    adapter: Arc<ScriptAdapter>,
    on_receive: Arc<dyn ReceiveHandler>,
}

/// 请求体按 UTF-8 宽松解析，整体编码为字符串帧。
async fn handle_any(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let raw = json!({
        "path": uri.path(),
        "method": method.as_str(),
        "body": String::from_utf8_lossy(&body),
    })
    .to_string();
    debug!(target: "gw.http", key = %state.key, %method, path = uri.path(), bytes = body.len(), "http request received");
    match state.adapter.decode(&raw) {
        Ok(data) => {
            if !data.is_empty() {
                state.on_receive.handle(data).await;
            }
            Json(json!({"code": 0, "message": "ok"})).into_response()
        }
        Err(e) => {
            warn!(target: "gw.http", key = %state.key, path = uri.path(), error = %e, "http request decode failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"code": -1, "message": e.to_string()})),
            )
                .into_response()
        }
    }
}

pub struct HttpServerPlugin {
    key: String,
    adapter: Arc<ScriptAdapter>,
    local_addrs: HashMap<String, SocketAddr>,
    shutdown: Mutex<Vec<oneshot::Sender<()>>>,
    tasks: TaskSet,
}

impl HttpServerPlugin {
    pub async fn initialize(ctx: &PluginContext) -> Result<Self, ProtocolError> {
        let adapter = Arc::new(ScriptAdapter::listener(
            ctx.key(),
            "http_server",
            ctx.script.clone(),
        ));
        let state = ServerState {
            key: Arc::from(ctx.key()),
            adapter: adapter.clone(),
            on_receive: ctx.on_receive.clone(),
        };
        let tasks = TaskSet::new();
        let mut shutdown = Vec::new();
        let mut local_addrs = HashMap::new();
        for (key, raw) in &ctx.config.connections {
            let config: HttpServerConfig = connection_config(key, raw)?;
            let listener = TcpListener::bind((config.host.as_str(), config.port))
                .await
                .map_err(|e| {
                    ProtocolError::Config(format!(
                        "connection {key}: bind {}:{}: {e}",
                        config.host, config.port
                    ))
                })?;
            let addr = listener.local_addr()?;
            let app = Router::new().fallback(handle_any).with_state(state.clone());
            let (tx, rx) = oneshot::channel::<()>();
            let plugin_key = ctx.key().to_string();
            tasks.push(tokio::spawn(async move {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = rx.await;
                    })
                    .await;
                if let Err(e) = served {
                    warn!(target: "gw.http", key = %plugin_key, error = %e, "http server stopped");
                }
            }));
            info!(target: "gw.http", key = %ctx.key(), connection = %key, %addr, "http server listening");
            shutdown.push(tx);
            local_addrs.insert(key.clone(), addr);
        }
        Ok(Self {
            key: ctx.key().to_string(),
            adapter,
            local_addrs,
            shutdown: Mutex::new(shutdown),
            tasks,
        })
    }

    /// 连接实际监听的地址（端口配置为 0 时由系统分配）。
    pub fn local_addr(&self, connection_key: &str) -> Option<SocketAddr> {
        self.local_addrs.get(connection_key).copied()
    }
}

#[async_trait]
impl Plugin for HttpServerPlugin {
    fn protocol_name(&self) -> &'static str {
        "http_server"
    }

    fn protocol_adapter(&self) -> Arc<dyn ProtocolAdapter> {
        self.adapter.clone()
    }

    async fn connector(&self, _device_sn: &str) -> Result<Box<dyn Connector>, ProtocolError> {
        Ok(Box::new(ListenerConnector {
            protocol: "http_server",
        }))
    }

    async fn destroy(&self) -> Result<(), ProtocolError> {
        let senders: Vec<_> = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for tx in senders {
            let _ = tx.send(());
        }
        self.tasks.abort_all();
        info!(target: "gw.http", key = %self.key, "http server plugin destroyed");
        Ok(())
    }
}
