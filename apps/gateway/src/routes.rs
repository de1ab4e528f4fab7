//! 路由定义
//!
//! - 运行状态：/health, /metrics
//! - 设备影子：/shadow/all, /shadow/device, /shadow/devicePoint
//! - 点位读写：/device/readPoints, /device/writePoints
//! - 脚本缓存：/plugin/cache/get, /plugin/cache/set
//! - 配置更新：/config/update

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::bootstrap::Gateway;
use crate::handlers::*;
use crate::middleware::request_context;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/shadow/all", get(shadow_all))
        .route("/shadow/device", get(shadow_device))
        .route("/shadow/devicePoint", get(shadow_device_point))
        .route("/device/readPoints", post(read_points))
        .route("/device/writePoints", post(write_points))
        .route("/plugin/cache/get", get(cache_get))
        .route("/plugin/cache/set", post(cache_set))
        .route("/config/update", post(update_config))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_context))
        // 外层先补齐 x-request-id，再回写到响应头
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
