//! REST 处理函数。

mod device;
mod shadow;
mod system;

pub use device::{read_points, write_points};
pub use shadow::{shadow_all, shadow_device, shadow_device_point};
pub use system::{cache_get, cache_set, health, metrics, update_config};

use std::sync::Arc;

use axum::response::Response;

use crate::AppState;
use crate::bootstrap::Epoch;
use crate::response::internal_error;

/// 当前运行中的 Epoch；重载窗口内没有时返回 500。
fn current_epoch(state: &AppState) -> Result<Arc<Epoch>, Response> {
    state
        .gateway
        .current()
        .ok_or_else(|| internal_error("configuration is reloading"))
}
