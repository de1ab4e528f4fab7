use gw_script::{PluginCache, SCRIPT_FILE, ScriptError, ScriptSandbox};
use serde_json::{Value, json};
use tokio::sync::mpsc;

const SCRIPT: &str = r#"
function decode(raw) {
    var msg = JSON.parse(raw);
    return JSON.stringify([{ deviceSn: msg.sn, values: [{ pointName: "temp", value: msg.t }] }]);
}

function encode(deviceSn, payload) {
    var body = JSON.parse(payload);
    body.deviceSn = deviceSn;
    return JSON.stringify(body);
}

function remember(v) {
    setCache("last", v);
    return getCache("last");
}

function push() {
    publish("dev-1", { temp: 21.5, onOff: true });
}

function boom() {
    throw new Error("bad frame");
}

function mockRead(deviceSn, pointName) {
    return deviceSn + ":" + pointName;
}
"#;

fn sandbox() -> (ScriptSandbox, PluginCache, mpsc::UnboundedReceiver<domain::DeviceData>) {
    let cache = PluginCache::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let sandbox = ScriptSandbox::from_source("test", SCRIPT, cache.clone(), tx).expect("load script");
    (sandbox, cache, rx)
}

#[test]
fn decode_returns_device_data() {
    let (sandbox, _, _) = sandbox();
    let data = sandbox
        .decode(r#"{"sn":"dev-1","t":21}"#)
        .expect("decode");
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].device_sn, "dev-1");
    assert_eq!(data[0].values[0].point_name, "temp");
    assert_eq!(data[0].values[0].value, json!(21));
}

#[test]
fn encode_rewrites_payload() {
    let (sandbox, _, _) = sandbox();
    let out = sandbox
        .encode("dev-9", &json!({ "name": "onOff", "targetValue": 1 }))
        .expect("encode");
    assert_eq!(out["deviceSn"], json!("dev-9"));
    assert_eq!(out["name"], json!("onOff"));
}

#[test]
fn cache_is_shared_with_host() {
    let (sandbox, cache, _) = sandbox();
    let out = sandbox
        .call("remember", &[Value::String("v1".to_string())])
        .expect("call");
    assert_eq!(out, json!("v1"));
    assert_eq!(cache.get("last").as_deref(), Some("v1"));
}

#[test]
fn publish_feeds_channel() {
    let (sandbox, _, mut rx) = sandbox();
    sandbox.call("push", &[]).expect("call");
    let data = rx.try_recv().expect("published data");
    assert_eq!(data.device_sn, "dev-1");
    assert_eq!(data.values.len(), 2);
}

#[test]
fn script_failure_keeps_sandbox_usable() {
    let (sandbox, _, _) = sandbox();
    let err = sandbox.call("boom", &[]).expect_err("script throws");
    assert!(matches!(err, ScriptError::Call { .. }));

    let err = sandbox.call("missing", &[]).expect_err("no function");
    assert!(matches!(err, ScriptError::FunctionNotFound(_)));

    let value = sandbox.mock_read("dev-1", "temp").expect("mock read");
    assert_eq!(value, json!("dev-1:temp"));
}

#[test]
fn load_from_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(SCRIPT_FILE);
    std::fs::write(&path, SCRIPT).expect("write script");
    let (tx, _rx) = mpsc::unbounded_channel();
    let sandbox = ScriptSandbox::load("dir", &path, PluginCache::new(), tx).expect("load");
    assert!(sandbox.has_function("decode"));
    assert!(!sandbox.has_function("nope"));
}
