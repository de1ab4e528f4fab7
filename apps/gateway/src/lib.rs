//! 设备接入网关。
//!
//! ```text
//! 驱动配置目录 ─► Epoch（注册表 + 影子 + 脚本 + 插件 + 流水线 + 定时任务）
//!                    ▲
//! REST / MQTT 命令 ──┴─► CommandDispatcher ─► Plugin ─► 设备
//! ```
//!
//! 配置重载时整体构建新的 Epoch 并原子替换，旧 Epoch 的插件与后台任务随之销毁。

pub mod bootstrap;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

pub use bootstrap::{BootstrapError, Epoch, EpochCell, Gateway, GatewaySettings};
pub use routes::{AppState, create_router};
