use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::routing::get;
use domain::{DeviceConfig, DeviceData, EncodeMode, PointData};
use gw_protocol::{
    HttpClientPlugin, HttpServerPlugin, Plugin, PluginContext, ProtocolError, ReceiveHandler,
    Registry, TcpServerPlugin,
};
use gw_script::{PluginCache, ScriptSandbox};
use gw_storage::DeviceShadow;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const SCRIPT: &str = r#"
function decode(raw) {
    var frame = JSON.parse(raw);
    if (frame.path !== undefined) {
        if (frame.path === "/broken") {
            throw new Error("unknown path");
        }
        return [{ deviceSn: "dev-1", values: [{ pointName: "body", value: frame.body }] }];
    }
    return [{ deviceSn: "dev-1", values: [{ pointName: "hex", value: frame.hex }] }];
}
"#;

#[derive(Default)]
struct Recorder {
    frames: Mutex<Vec<DeviceData>>,
}

impl Recorder {
    fn values(&self) -> Vec<PointData> {
        self.frames
            .lock()
            .expect("lock")
            .iter()
            .flat_map(|d| d.values.clone())
            .collect()
    }
}

#[async_trait]
impl ReceiveHandler for Recorder {
    async fn handle(&self, data: Vec<DeviceData>) {
        self.frames.lock().expect("lock").extend(data);
    }
}

fn context(config: Value, with_script: bool) -> (PluginContext, Arc<Recorder>) {
    let config: DeviceConfig = serde_json::from_value(config).expect("config");
    let mut configs = BTreeMap::new();
    configs.insert(config.key.clone(), config.clone());
    let registry: Registry = Registry::build(&configs).expect("registry");
    let script = with_script.then(|| {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(
            ScriptSandbox::from_source(&config.key, SCRIPT, PluginCache::new(), tx)
                .expect("script"),
        )
    });
    let recorder = Arc::new(Recorder::default());
    let ctx = PluginContext {
        config: Arc::new(config),
        registry: Arc::new(registry),
        shadow: DeviceShadow::new(Duration::from_secs(60)),
        script,
        on_receive: recorder.clone(),
        virtual_mode: false,
    };
    (ctx, recorder)
}

#[tokio::test]
async fn tcp_server_decodes_each_read() {
    let (ctx, recorder) = context(
        json!({
            "key": "tcp",
            "protocolName": "tcp_server",
            "connections": {"listen": {"host": "127.0.0.1", "port": 0}}
        }),
        true,
    );
    let plugin = TcpServerPlugin::initialize(&ctx).await.expect("plugin");
    let addr = plugin.local_addr("listen").expect("addr");

    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    stream.write_all(&[0x01, 0x02, 0xFF]).await.expect("write");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(recorder.values(), vec![PointData::new("hex", json!("0102ff"))]);

    let err = plugin
        .connector("dev-1")
        .await
        .expect("connector")
        .send(gw_protocol::Frame::Payload(json!({})))
        .await
        .expect_err("listener does not send");
    assert!(matches!(err, ProtocolError::UnsupportedOperation(_)));
    plugin.destroy().await.expect("destroy");
}

#[tokio::test]
async fn http_server_answers_and_forwards() {
    let (ctx, recorder) = context(
        json!({
            "key": "hook",
            "protocolName": "http_server",
            "connections": {"web": {"host": "127.0.0.1", "port": 0}}
        }),
        true,
    );
    let plugin = HttpServerPlugin::initialize(&ctx).await.expect("plugin");
    let addr = plugin.local_addr("web").expect("addr");
    let client = reqwest::Client::new();

    let ok: Value = client
        .post(format!("http://{addr}/report"))
        .body("t=21")
        .send()
        .await
        .expect("post")
        .json()
        .await
        .expect("json");
    assert_eq!(ok, json!({"code": 0, "message": "ok"}));
    assert_eq!(recorder.values(), vec![PointData::new("body", json!("t=21"))]);

    let failed = client
        .get(format!("http://{addr}/broken"))
        .send()
        .await
        .expect("get");
    assert_eq!(failed.status().as_u16(), 500);
    let body: Value = failed.json().await.expect("json");
    assert_eq!(body["code"], json!(-1));

    plugin.destroy().await.expect("destroy");
}

#[tokio::test]
async fn http_client_forwards_response_body() {
    let app = Router::new().route(
        "/points",
        get(|| async { r#"[{"deviceSn":"dev-1","values":[{"pointName":"temp","value":22}]}]"# }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let (ctx, recorder) = context(
        json!({
            "key": "api",
            "protocolName": "http_client",
            "connections": {"rest": {"url": format!("http://{addr}/points"), "timeout": "2s"}},
            "deviceModels": [{
                "name": "sensor",
                "devicePoints": [{"name": "temp", "valueType": "int", "readWrite": "R"}],
                "devices": [{"deviceSn": "dev-1", "modelName": "sensor", "connectionKey": "rest"}]
            }]
        }),
        false,
    );
    let plugin = HttpClientPlugin::initialize(&ctx).expect("plugin");
    let frame = plugin
        .protocol_adapter()
        .encode("dev-1", EncodeMode::Read, &[PointData::new("temp", Value::Null)])
        .expect("encode");
    plugin
        .connector("dev-1")
        .await
        .expect("connector")
        .send(frame)
        .await
        .expect("request");

    assert_eq!(recorder.values(), vec![PointData::new("temp", json!(22))]);

    let frame = plugin
        .protocol_adapter()
        .encode("dev-1", EncodeMode::Read, &[PointData::new("temp", Value::Null)])
        .expect("encode");
    let missing = match frame {
        gw_protocol::Frame::Payload(mut v) => {
            v["protocol"] = json!({"url": format!("http://{addr}/missing")});
            gw_protocol::Frame::Payload(v)
        }
        other => other,
    };
    let err = plugin
        .connector("dev-1")
        .await
        .expect("connector")
        .send(missing)
        .await
        .expect_err("404");
    assert!(err.is_transport());

    plugin.destroy().await.expect("destroy");
    server.abort();
}
