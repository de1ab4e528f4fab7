//! 协议插件共用的小工具：配置解析与后台任务集合。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use domain::DeviceConfig;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::ProtocolError;

/// 解析 "1s" / "500ms" / 纯数字（毫秒）形式的时长，空串回落到默认值。
pub fn parse_duration(raw: &str, default: Duration) -> Result<Duration, ProtocolError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(default);
    }
    if let Ok(ms) = raw.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(raw).map_err(|e| ProtocolError::Config(format!("duration {raw}: {e}")))
}

/// 从扩展属性中读取时长字段。
pub fn duration_field(
    value: Option<&Value>,
    default: Duration,
) -> Result<Duration, ProtocolError> {
    match value {
        None | Some(Value::Null) => Ok(default),
        Some(Value::String(s)) => parse_duration(s, default),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Duration::from_millis)
            .ok_or_else(|| ProtocolError::Config(format!("duration {n}"))),
        Some(other) => Err(ProtocolError::Config(format!("duration {other}"))),
    }
}

/// 反序列化连接配置（`connections.<key>`）。
pub fn connection_config<T: DeserializeOwned>(key: &str, raw: &Value) -> Result<T, ProtocolError> {
    serde_json::from_value(raw.clone())
        .map_err(|e| ProtocolError::Config(format!("connection {key}: {e}")))
}

/// deviceSn → connectionKey。
pub fn device_connections(config: &DeviceConfig) -> HashMap<String, String> {
    config
        .devices()
        .map(|(_, device)| (device.device_sn.clone(), device.connection_key.clone()))
        .collect()
}

/// 小写十六进制。
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// 插件持有的后台任务，`destroy` 时统一中止。
#[derive(Debug, Default)]
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记任务，顺带清理已结束的句柄。
    pub fn push(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn abort_all(&self) {
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        let d = Duration::from_secs(1);
        assert_eq!(parse_duration("", d).expect("empty"), d);
        assert_eq!(parse_duration("250", d).expect("ms"), Duration::from_millis(250));
        assert_eq!(parse_duration("5s", d).expect("5s"), Duration::from_secs(5));
        assert_eq!(parse_duration("100ms", d).expect("100ms"), Duration::from_millis(100));
        assert!(parse_duration("soon", d).is_err());
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x01, 0xAB, 0xFF]), "01abff");
        assert_eq!(to_hex(&[]), "");
    }

    #[tokio::test]
    async fn test_task_set_abort() {
        let tasks = TaskSet::new();
        tasks.push(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));
        assert_eq!(tasks.len(), 1);
        tasks.abort_all();
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_duration_field() {
        let d = Duration::from_secs(1);
        assert_eq!(duration_field(None, d).expect("none"), d);
        let v = serde_json::json!(2000);
        assert_eq!(duration_field(Some(&v), d).expect("num"), Duration::from_secs(2));
    }
}
