//! 运行状态、脚本缓存与配置更新

use api_contract::{CacheQuery, ConfigUpdateDto, HealthDto};
use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use domain::DeviceConfig;
use gw_config::ConfigError;
use serde_json::json;
use tracing::warn;

use crate::AppState;
use crate::bootstrap::BootstrapError;
use crate::response::{config_error, internal_error, ok};

/// GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    let dto = match state.gateway.current() {
        Some(epoch) => HealthDto {
            status: "ok".to_string(),
            connectors: epoch.registry().configs().count(),
            devices: epoch.registry().devices().len(),
            online: epoch.shadow().snapshots().iter().filter(|d| d.online).count(),
        },
        None => HealthDto {
            status: "reloading".to_string(),
            connectors: 0,
            devices: 0,
            online: 0,
        },
    };
    ok(dto)
}

/// GET /metrics
pub async fn metrics() -> Response {
    ok(gw_telemetry::metrics().snapshot())
}

/// GET /plugin/cache/get?key=，返回 `{key: value}`，未设置时值为 null
pub async fn cache_get(State(state): State<AppState>, Query(query): Query<CacheQuery>) -> Response {
    let value = state.gateway.cache().get(&query.key);
    let mut body = serde_json::Map::new();
    body.insert(query.key, json!(value));
    Json(body).into_response()
}

/// POST /plugin/cache/set?key=，请求体原样作为值
pub async fn cache_set(
    State(state): State<AppState>,
    Query(query): Query<CacheQuery>,
    body: String,
) -> Response {
    state.gateway.cache().set(query.key, body);
    ok(())
}

/// POST /config/update
///
/// 写入驱动目录配置并整体重载；失败时配置文件与运行中的配置保持不变。
pub async fn update_config(State(state): State<AppState>, body: String) -> Response {
    let config: DeviceConfig = match serde_json::from_str(&body) {
        Ok(config) => config,
        Err(e) => return config_error(e.to_string()),
    };
    match state.gateway.update_config(&config).await {
        Ok(epoch) => ok(ConfigUpdateDto {
            key: config.key,
            connectors: epoch.registry().configs().count(),
            devices: epoch.registry().devices().len(),
        }),
        Err(e) => {
            warn!(target: "gw.api", key = %config.key, error = %e, "config update rejected");
            match e {
                BootstrapError::Config(ConfigError::Io { .. }) => internal_error(e.to_string()),
                other => config_error(other.to_string()),
            }
        }
    }
}
