use std::path::Path;
use std::sync::Mutex;

use domain::DeviceData;
use rquickjs::{CatchResultExt, Context, Ctx, Function, Runtime, Value as JsValue};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::ScriptError;
use crate::cache::PluginCache;
use crate::host::register_host_api;

/// 脚本 `publish` 的出口，接收端由宿主接入接收流水线。
pub type ScriptPublisher = UnboundedSender<DeviceData>;

struct Engine {
    _runtime: Runtime,
    context: Context,
}

/// 单个驱动目录的脚本沙箱。所有调用经同一把互斥锁串行执行。
pub struct ScriptSandbox {
    key: String,
    engine: Mutex<Engine>,
}

impl std::fmt::Debug for ScriptSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptSandbox").field("key", &self.key).finish()
    }
}

impl ScriptSandbox {
    /// 读取脚本文件并创建沙箱。
    pub fn load(
        key: &str,
        path: &Path,
        cache: PluginCache,
        publisher: ScriptPublisher,
    ) -> Result<Self, ScriptError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_source(key, &source, cache, publisher)
    }

    pub fn from_source(
        key: &str,
        source: &str,
        cache: PluginCache,
        publisher: ScriptPublisher,
    ) -> Result<Self, ScriptError> {
        let runtime = Runtime::new().map_err(|e| ScriptError::Engine(e.to_string()))?;
        let context = Context::full(&runtime).map_err(|e| ScriptError::Engine(e.to_string()))?;

        context.with(|ctx| -> Result<(), ScriptError> {
            register_host_api(&ctx, key, cache, publisher)
                .map_err(|e| ScriptError::Engine(e.to_string()))?;
            ctx.eval::<(), _>(source)
                .catch(&ctx)
                .map_err(|e| ScriptError::Engine(format!("{key}: {e}")))?;
            Ok(())
        })?;

        debug!(target: "gw.script", key, "script sandbox loaded");
        Ok(Self {
            key: key.to_string(),
            engine: Mutex::new(Engine {
                _runtime: runtime,
                context,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn has_function(&self, name: &str) -> bool {
        match self.engine.lock() {
            Ok(engine) => engine
                .context
                .with(|ctx| ctx.globals().get::<_, Function>(name).is_ok()),
            Err(_) => false,
        }
    }

    /// 调用全局函数，参数以 JSON 值传入，返回值转换为 JSON。
    ///
    /// 字符串返回值原样保留为 `Value::String`，`undefined` 视为 `Value::Null`。
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, ScriptError> {
        let engine = self.engine.lock().map_err(|_| ScriptError::Lock)?;
        engine.context.with(|ctx| {
            let func: Function = ctx
                .globals()
                .get(name)
                .map_err(|_| ScriptError::FunctionNotFound(name.to_string()))?;

            let mut js_args = Vec::with_capacity(args.len());
            for arg in args {
                js_args.push(json_to_js(&ctx, arg)?);
            }
            let mut js_args = js_args.into_iter();
            let result = match args.len() {
                0 => func.call::<_, JsValue>(()),
                1 => func.call((js_args.next(),)),
                2 => func.call((js_args.next(), js_args.next())),
                3 => func.call((js_args.next(), js_args.next(), js_args.next())),
                n => {
                    return Err(ScriptError::Call {
                        name: name.to_string(),
                        message: format!("unsupported argument count {n}"),
                    });
                }
            }
            .catch(&ctx)
            .map_err(|e| ScriptError::Call {
                name: name.to_string(),
                message: e.to_string(),
            })?;

            js_to_json(&ctx, result)
        })
    }

    /// `decode(raw)`：原始帧 → 设备数据列表。
    pub fn decode(&self, raw: &str) -> Result<Vec<DeviceData>, ScriptError> {
        let result = self.call("decode", &[Value::String(raw.to_string())])?;
        let result = match result {
            Value::String(text) => serde_json::from_str(&text)
                .map_err(|e| ScriptError::Malformed(format!("decode: {e}")))?,
            other => other,
        };
        match result {
            Value::Null => Ok(Vec::new()),
            other => serde_json::from_value(other)
                .map_err(|e| ScriptError::Malformed(format!("decode: {e}"))),
        }
    }

    /// `encode(deviceSn, json)`：下发前改写载荷。返回值若为 JSON 文本则解析为对象。
    pub fn encode(&self, device_sn: &str, payload: &Value) -> Result<Value, ScriptError> {
        let text = payload.to_string();
        let result = self.call(
            "encode",
            &[Value::String(device_sn.to_string()), Value::String(text)],
        )?;
        Ok(match result {
            Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            other => other,
        })
    }

    /// 虚拟连接读取。
    pub fn mock_read(&self, device_sn: &str, point_name: &str) -> Result<Value, ScriptError> {
        self.call(
            "mockRead",
            &[
                Value::String(device_sn.to_string()),
                Value::String(point_name.to_string()),
            ],
        )
    }

    /// 虚拟连接写入。
    pub fn mock_write(
        &self,
        device_sn: &str,
        point_name: &str,
        value: &Value,
    ) -> Result<(), ScriptError> {
        self.call(
            "mockWrite",
            &[
                Value::String(device_sn.to_string()),
                Value::String(point_name.to_string()),
                value.clone(),
            ],
        )
        .map(|_| ())
    }
}

fn json_to_js<'js>(ctx: &Ctx<'js>, value: &Value) -> Result<JsValue<'js>, ScriptError> {
    ctx.json_parse(value.to_string())
        .map_err(|e| ScriptError::Engine(e.to_string()))
}

fn js_to_json<'js>(ctx: &Ctx<'js>, value: JsValue<'js>) -> Result<Value, ScriptError> {
    if value.is_undefined() || value.is_null() {
        return Ok(Value::Null);
    }
    if let Some(text) = value.as_string() {
        let text = text
            .to_string()
            .map_err(|e| ScriptError::Malformed(e.to_string()))?;
        return Ok(Value::String(text));
    }
    let text = ctx
        .json_stringify(value)
        .map_err(|e| ScriptError::Malformed(e.to_string()))?
        .map(|s| s.to_string())
        .transpose()
        .map_err(|e| ScriptError::Malformed(e.to_string()))?;
    match text {
        Some(text) => {
            serde_json::from_str(&text).map_err(|e| ScriptError::Malformed(e.to_string()))
        }
        None => Ok(Value::Null),
    }
}
