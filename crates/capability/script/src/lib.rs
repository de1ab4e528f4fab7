//! 脚本沙箱能力模块。
//!
//! 每个驱动目录可放置一个 `converter.js`，加载后成为该目录的 [`ScriptSandbox`]：
//!
//! - 宿主调用脚本：`decode(raw)`、`encode(deviceSn, json)`、`mockRead`、`mockWrite`，
//!   以及定时任务指定的任意全局函数
//! - 脚本调用宿主：`setCache`/`getCache`（进程级字符串缓存）、`publish(deviceSn, {point: value})`
//!
//! 同一沙箱的调用串行执行；脚本异常以 [`ScriptError`] 返回，沙箱保持可用。

mod cache;
mod host;
mod sandbox;

pub use cache::PluginCache;
pub use sandbox::{ScriptPublisher, ScriptSandbox};

/// 驱动目录内的脚本文件名。
pub const SCRIPT_FILE: &str = "converter.js";

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("script engine error: {0}")]
    Engine(String),
    #[error("script function not found: {0}")]
    FunctionNotFound(String),
    #[error("script call {name} failed: {message}")]
    Call { name: String, message: String },
    #[error("script returned malformed result: {0}")]
    Malformed(String),
    #[error("script sandbox lock poisoned")]
    Lock,
}
