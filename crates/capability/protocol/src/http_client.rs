//! HTTP Client 插件：点位读写转换为一次 HTTP 请求，响应体经脚本解码后进入接收流水线。
//!
//! 编码产物为 `{mode, values, protocol}`，`protocol` 中的字段覆盖连接配置：
//!
//! ```json
//! { "url": "http://dev/api", "method": "POST",
//!   "headers": { "Content-Type": "application/json" },
//!   "form": {}, "dataUrlEncode": {}, "dataRaw": "{...}", "timeout": "3s" }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{EncodeMode, PointData};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::ProtocolError;
use crate::plugin::{
    Connector, Frame, Plugin, PluginContext, ProtocolAdapter, ReceiveHandler, ScriptAdapter,
    forward_decoded,
};
use crate::types::{connection_config, device_connections, duration_field};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// 单个或多个同名 header 值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    fn values(&self) -> Vec<&str> {
        match self {
            Self::One(v) => vec![v.as_str()],
            Self::Many(vs) => vs.iter().map(String::as_str).collect(),
        }
    }
}

/// 请求描述；连接配置与脚本覆盖项共用。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, HeaderValues>,
    /// multipart/form-data
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub form: BTreeMap<String, String>,
    /// application/x-www-form-urlencoded
    #[serde(default, alias = "data_url_encode", skip_serializing_if = "BTreeMap::is_empty")]
    pub data_url_encode: BTreeMap<String, String>,
    #[serde(default, alias = "data_raw", skip_serializing_if = "Option::is_none")]
    pub data_raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
}

impl RequestSpec {
    /// 用 `overrides` 中出现的字段覆盖自身，header 逐项合并。
    pub fn merged(&self, overrides: &RequestSpec) -> RequestSpec {
        let mut headers = self.headers.clone();
        headers.extend(overrides.headers.clone());
        RequestSpec {
            url: overrides.url.clone().or_else(|| self.url.clone()),
            method: overrides.method.clone().or_else(|| self.method.clone()),
            headers,
            form: if overrides.form.is_empty() {
                self.form.clone()
            } else {
                overrides.form.clone()
            },
            data_url_encode: if overrides.data_url_encode.is_empty() {
                self.data_url_encode.clone()
            } else {
                overrides.data_url_encode.clone()
            },
            data_raw: overrides.data_raw.clone().or_else(|| self.data_raw.clone()),
            timeout: overrides.timeout.clone().or_else(|| self.timeout.clone()),
        }
    }

    fn method(&self) -> Result<Method, ProtocolError> {
        let raw = self.method.as_deref().unwrap_or("GET").trim().to_ascii_uppercase();
        Method::from_bytes(raw.as_bytes())
            .map_err(|e| ProtocolError::Encode(format!("http method {raw}: {e}")))
    }

    fn timeout(&self) -> Result<Duration, ProtocolError> {
        duration_field(self.timeout.as_ref(), DEFAULT_HTTP_TIMEOUT)
    }

    fn build(&self, client: &reqwest::Client) -> Result<reqwest::RequestBuilder, ProtocolError> {
        let url = self
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ProtocolError::Encode("http request has no url".to_string()))?;
        let mut request = client.request(self.method()?, url).timeout(self.timeout()?);
        for (name, values) in &self.headers {
            for value in values.values() {
                request = request.header(name.as_str(), value);
            }
        }
        if let Some(raw) = &self.data_raw {
            request = request.body(raw.clone());
        } else if !self.form.is_empty() {
            let mut form = reqwest::multipart::Form::new();
            for (k, v) in &self.form {
                form = form.text(k.clone(), v.clone());
            }
            request = request.multipart(form);
        } else if !self.data_url_encode.is_empty() {
            request = request.form(&self.data_url_encode);
        }
        Ok(request)
    }
}

/// 编码：单个点位组装为 `{mode, values, protocol}`，有脚本 `encode` 时交给脚本改写。
fn encode_request(
    adapter: &ScriptAdapter,
    device_sn: &str,
    mode: EncodeMode,
    points: &[PointData],
) -> Result<Frame, ProtocolError> {
    let [point] = points else {
        return Err(ProtocolError::Encode(format!(
            "http client encodes exactly one point, got {}",
            points.len()
        )));
    };
    let payload = json!({
        "mode": mode,
        "values": point,
        "protocol": {},
    });
    let encoded = adapter.script_encode(device_sn, &payload)?.unwrap_or(payload);
    Ok(Frame::Payload(encoded))
}

/// 从编码产物中取出请求覆盖项。
pub fn request_overrides(frame: &Value) -> Result<RequestSpec, ProtocolError> {
    let frame = match frame {
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| ProtocolError::Encode(format!("http frame {s}: {e}")))?,
        other => other.clone(),
    };
    match frame.get("protocol") {
        None | Some(Value::Null) => Ok(RequestSpec::default()),
        Some(protocol) => serde_json::from_value(protocol.clone())
            .map_err(|e| ProtocolError::Encode(format!("http frame protocol: {e}"))),
    }
}

pub struct HttpClientConnector {
    key: String,
    client: reqwest::Client,
    base: Arc<RequestSpec>,
    adapter: Arc<ScriptAdapter>,
    on_receive: Arc<dyn ReceiveHandler>,
}

#[async_trait]
impl Connector for HttpClientConnector {
    async fn send(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let Frame::Payload(frame) = frame else {
            return Err(ProtocolError::UnsupportedOperation(
                "http client only sends payload frames".to_string(),
            ));
        };
        let spec = self.base.merged(&request_overrides(&frame)?);
        let method = spec.method()?;
        let url = spec.url.clone().unwrap_or_default();
        let response = spec.build(&self.client)?.send().await.map_err(|e| {
            if e.is_timeout() {
                ProtocolError::Timeout(format!("{method} {url}"))
            } else {
                ProtocolError::Connection(format!("{method} {url}: {e}"))
            }
        })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProtocolError::Connection(format!("{method} {url}: {e}")))?;
        debug!(target: "gw.http", key = %self.key, %method, %url, status = status.as_u16(), "http response");
        if !status.is_success() {
            return Err(ProtocolError::Connection(format!(
                "{method} {url}: status {status}"
            )));
        }
        if !body.trim().is_empty() {
            forward_decoded(&self.key, self.adapter.as_ref(), self.on_receive.as_ref(), &body).await;
        }
        Ok(())
    }
}

pub struct HttpClientPlugin {
    key: String,
    client: reqwest::Client,
    adapter: Arc<ScriptAdapter>,
    on_receive: Arc<dyn ReceiveHandler>,
    connections: HashMap<String, Arc<RequestSpec>>,
    devices: HashMap<String, String>,
}

impl HttpClientPlugin {
    pub fn initialize(ctx: &PluginContext) -> Result<Self, ProtocolError> {
        let mut connections = HashMap::new();
        for (key, raw) in &ctx.config.connections {
            let spec: RequestSpec = connection_config(key, raw)?;
            spec.method().map_err(|e| ProtocolError::Config(format!("connection {key}: {e}")))?;
            spec.timeout()?;
            info!(target: "gw.http", key = %ctx.key(), connection = %key, url = spec.url.as_deref().unwrap_or(""), "http client connection created");
            connections.insert(key.clone(), Arc::new(spec));
        }
        Ok(Self {
            key: ctx.key().to_string(),
            client: reqwest::Client::new(),
            adapter: Arc::new(ScriptAdapter::with_encoder(
                ctx.key(),
                "http_client",
                ctx.script.clone(),
                encode_request,
            )),
            on_receive: ctx.on_receive.clone(),
            connections,
            devices: device_connections(&ctx.config),
        })
    }
}

#[async_trait]
impl Plugin for HttpClientPlugin {
    fn protocol_name(&self) -> &'static str {
        "http_client"
    }

    fn protocol_adapter(&self) -> Arc<dyn ProtocolAdapter> {
        self.adapter.clone()
    }

    async fn connector(&self, device_sn: &str) -> Result<Box<dyn Connector>, ProtocolError> {
        let key = self
            .devices
            .get(device_sn)
            .ok_or_else(|| ProtocolError::NotFound(format!("device {device_sn}")))?;
        let base = self
            .connections
            .get(key)
            .ok_or_else(|| ProtocolError::NotFound(format!("connection {key}")))?;
        Ok(Box::new(HttpClientConnector {
            key: self.key.clone(),
            client: self.client.clone(),
            base: base.clone(),
            adapter: self.adapter.clone(),
            on_receive: self.on_receive.clone(),
        }))
    }

    async fn destroy(&self) -> Result<(), ProtocolError> {
        info!(target: "gw.http", key = %self.key, "http client plugin destroyed");
        Ok(())
    }
}
