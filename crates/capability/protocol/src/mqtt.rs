//! MQTT 插件：订阅配置的主题，消息经脚本解码；写入经脚本编码为 `{topic, payload}` 后发布。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{EncodeMode, PointData};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::plugin::{
    Connector, Frame, Plugin, PluginContext, ProtocolAdapter, ReceiveHandler, ScriptAdapter,
    forward_decoded,
};
use crate::types::{TaskSet, connection_config, device_connections, duration_field};

pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttConnectionConfig {
    #[serde(default)]
    pub client_id: String,
    /// `tcp://host:1883`、`mqtt://host` 或 `host:port`
    pub broker: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub keep_alive: Option<Value>,
}

/// 拆分 broker 地址。
pub fn parse_broker(broker: &str) -> Result<(String, u16), ProtocolError> {
    let rest = broker
        .trim()
        .trim_start_matches("tcp://")
        .trim_start_matches("mqtt://")
        .trim_end_matches('/');
    if rest.is_empty() {
        return Err(ProtocolError::Config("mqtt broker is empty".to_string()));
    }
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|e| ProtocolError::Config(format!("mqtt broker {broker}: {e}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), DEFAULT_MQTT_PORT)),
    }
}

pub fn qos_of(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

impl MqttConnectionConfig {
    fn options(&self, plugin_key: &str, connection_key: &str) -> Result<MqttOptions, ProtocolError> {
        let (host, port) = parse_broker(&self.broker)?;
        let client_id = if self.client_id.trim().is_empty() {
            format!("driver-gateway-{plugin_key}-{connection_key}-{}", uuid::Uuid::new_v4().simple())
        } else {
            self.client_id.clone()
        };
        let mut options = MqttOptions::new(client_id, host, port);
        let keep_alive = duration_field(self.keep_alive.as_ref(), Duration::from_secs(30))?;
        options.set_keep_alive(keep_alive.max(Duration::from_secs(5)));
        if let Some(username) = self.username.as_ref().filter(|u| !u.is_empty()) {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        Ok(options)
    }
}

/// 写入编码：`{pointName, value}`（多点时为数组）交给脚本 `encode`，返回 `{topic, payload}`。
fn encode_write(
    adapter: &ScriptAdapter,
    device_sn: &str,
    mode: EncodeMode,
    points: &[PointData],
) -> Result<Frame, ProtocolError> {
    if !matches!(mode, EncodeMode::Write) {
        return Err(ProtocolError::UnsupportedOperation(
            "mqtt does not support read".to_string(),
        ));
    }
    let payload = match points {
        [single] => serde_json::to_value(single),
        many => serde_json::to_value(many),
    }
    .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    match adapter.script_encode(device_sn, &payload)? {
        Some(encoded) => Ok(Frame::Payload(encoded)),
        None => Err(ProtocolError::UnsupportedOperation(format!(
            "{}: mqtt write needs a script encode function",
            adapter.key()
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct Outgoing {
    topic: String,
    payload: Value,
}

impl Outgoing {
    fn bytes(&self) -> Vec<u8> {
        match &self.payload {
            Value::String(s) => s.as_bytes().to_vec(),
            other => other.to_string().into_bytes(),
        }
    }
}

/// 脚本编码结果：单个对象或数组。
fn outgoing(frame: Value) -> Result<Vec<Outgoing>, ProtocolError> {
    let parsed = match frame {
        Value::Array(_) => serde_json::from_value::<Vec<Outgoing>>(frame),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(inner) => return outgoing(inner),
            Err(e) => return Err(ProtocolError::Encode(format!("mqtt frame {s}: {e}"))),
        },
        other => serde_json::from_value::<Outgoing>(other).map(|o| vec![o]),
    };
    parsed.map_err(|e| ProtocolError::Encode(format!("mqtt frame needs topic and payload: {e}")))
}

struct MqttLink {
    client: AsyncClient,
    qos: QoS,
}

pub struct MqttConnector {
    client: AsyncClient,
    qos: QoS,
}

#[async_trait]
impl Connector for MqttConnector {
    async fn send(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let Frame::Payload(value) = frame else {
            return Err(ProtocolError::UnsupportedOperation(
                "mqtt connector only sends payload frames".to_string(),
            ));
        };
        for message in outgoing(value)? {
            debug!(target: "gw.mqtt", topic = %message.topic, "publish");
            self.client
                .publish(message.topic.as_str(), self.qos, false, message.bytes())
                .await
                .map_err(|e| ProtocolError::Connection(format!("mqtt publish {}: {e}", message.topic)))?;
        }
        Ok(())
    }
}

pub struct MqttPlugin {
    key: String,
    adapter: Arc<ScriptAdapter>,
    links: HashMap<String, MqttLink>,
    devices: HashMap<String, String>,
    tasks: TaskSet,
}

impl MqttPlugin {
    pub fn initialize(ctx: &PluginContext) -> Result<Self, ProtocolError> {
        let adapter = Arc::new(ScriptAdapter::with_encoder(
            ctx.key(),
            "mqtt",
            ctx.script.clone(),
            encode_write,
        ));
        let tasks = TaskSet::new();
        let mut links = HashMap::new();
        for (key, raw) in &ctx.config.connections {
            let config: MqttConnectionConfig = connection_config(key, raw)?;
            let options = config.options(ctx.key(), key)?;
            let (client, eventloop) = AsyncClient::new(options, 64);
            let qos = qos_of(config.qos);
            info!(target: "gw.mqtt", key = %ctx.key(), connection = %key, broker = %config.broker, topics = config.topics.len(), "mqtt connection created");
            tasks.push(tokio::spawn(receive_loop(
                ctx.key().to_string(),
                key.clone(),
                eventloop,
                client.clone(),
                config.topics.clone(),
                qos,
                adapter.clone(),
                ctx.on_receive.clone(),
            )));
            links.insert(key.clone(), MqttLink { client, qos });
        }
        Ok(Self {
            key: ctx.key().to_string(),
            adapter,
            links,
            devices: device_connections(&ctx.config),
            tasks,
        })
    }
}

/// 驱动事件循环；每次 ConnAck 后重新订阅。
#[allow(clippy::too_many_arguments)]
async fn receive_loop(
    plugin_key: String,
    connection_key: String,
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Vec<String>,
    qos: QoS,
    adapter: Arc<ScriptAdapter>,
    on_receive: Arc<dyn ReceiveHandler>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(target: "gw.mqtt", key = %plugin_key, connection = %connection_key, "mqtt connected");
                for topic in &topics {
                    if let Err(e) = client.subscribe(topic.as_str(), qos).await {
                        warn!(target: "gw.mqtt", connection = %connection_key, topic, error = %e, "subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let raw = json!({
                    "topic": publish.topic,
                    "payload": String::from_utf8_lossy(&publish.payload),
                })
                .to_string();
                forward_decoded(&plugin_key, adapter.as_ref(), on_receive.as_ref(), &raw).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target: "gw.mqtt", key = %plugin_key, connection = %connection_key, error = %e, "mqtt connection error, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[async_trait]
impl Plugin for MqttPlugin {
    fn protocol_name(&self) -> &'static str {
        "mqtt"
    }

    fn protocol_adapter(&self) -> Arc<dyn ProtocolAdapter> {
        self.adapter.clone()
    }

    async fn connector(&self, device_sn: &str) -> Result<Box<dyn Connector>, ProtocolError> {
        let key = self
            .devices
            .get(device_sn)
            .ok_or_else(|| ProtocolError::NotFound(format!("device {device_sn}")))?;
        let link = self
            .links
            .get(key)
            .ok_or_else(|| ProtocolError::NotFound(format!("connection {key}")))?;
        Ok(Box::new(MqttConnector {
            client: link.client.clone(),
            qos: link.qos,
        }))
    }

    async fn destroy(&self) -> Result<(), ProtocolError> {
        for (key, link) in &self.links {
            if let Err(e) = link.client.disconnect().await {
                debug!(target: "gw.mqtt", connection = %key, error = %e, "disconnect failed");
            }
        }
        self.tasks.abort_all();
        info!(target: "gw.mqtt", key = %self.key, "mqtt plugin destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker() {
        assert_eq!(
            parse_broker("tcp://127.0.0.1:1883").expect("tcp"),
            ("127.0.0.1".to_string(), 1883)
        );
        assert_eq!(
            parse_broker("broker.local").expect("bare"),
            ("broker.local".to_string(), DEFAULT_MQTT_PORT)
        );
        assert!(parse_broker("tcp://host:port").is_err());
        assert!(parse_broker("").is_err());
    }

    #[test]
    fn test_outgoing_frames() {
        let one = outgoing(json!({"topic": "a/b", "payload": {"on": true}})).expect("object");
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].bytes(), br#"{"on":true}"#.to_vec());

        let many = outgoing(json!([
            {"topic": "a", "payload": "1"},
            {"topic": "b", "payload": "2"}
        ]))
        .expect("array");
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].bytes(), b"2".to_vec());

        let text = outgoing(json!(r#"{"topic":"c","payload":"x"}"#)).expect("string");
        assert_eq!(text[0].topic, "c");
        assert!(outgoing(json!({"payload": "x"})).is_err());
    }

    #[test]
    fn test_write_without_script_is_unsupported() {
        let adapter = ScriptAdapter::with_encoder("m", "mqtt", None, encode_write);
        let err = adapter
            .encode("dev", EncodeMode::Write, &[PointData::new("p", json!(1))])
            .expect_err("no script");
        assert!(matches!(err, ProtocolError::UnsupportedOperation(_)));
        let err = adapter
            .encode("dev", EncodeMode::Read, &[PointData::new("p", Value::Null)])
            .expect_err("read");
        assert!(matches!(err, ProtocolError::UnsupportedOperation(_)));
    }
}
