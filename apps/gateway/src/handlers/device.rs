//! 点位读写
//!
//! - POST /device/readPoints - 逐点触发读取，结果经接收流水线上报
//! - POST /device/writePoints - 点位与取值按位置配对写入

use api_contract::DevicePointsRequest;
use axum::{Json, extract::State, response::Response};
use serde_json::Value;
use tracing::info;

use super::current_epoch;
use crate::AppState;
use crate::response::{control_error, ok};

pub async fn read_points(
    State(state): State<AppState>,
    Json(req): Json<DevicePointsRequest>,
) -> Response {
    let epoch = match current_epoch(&state) {
        Ok(epoch) => epoch,
        Err(response) => return response,
    };
    let names: Vec<String> = req.points.iter().map(|p| p.point_name.clone()).collect();
    match epoch.dispatcher().handle_read(&req.device_sn, &names).await {
        Ok(()) => ok(()),
        Err(e) => control_error(e),
    }
}

/// 未携带 `value` 的点位不参与配对，因此会触发数量不一致的 400。
pub async fn write_points(
    State(state): State<AppState>,
    Json(req): Json<DevicePointsRequest>,
) -> Response {
    let epoch = match current_epoch(&state) {
        Ok(epoch) => epoch,
        Err(response) => return response,
    };
    let names: Vec<String> = req.points.iter().map(|p| p.point_name.clone()).collect();
    let values: Vec<Value> = req.points.into_iter().filter_map(|p| p.value).collect();
    info!(target: "gw.api", device_sn = %req.device_sn, points = names.len(), "write points");
    match epoch.dispatcher().handle_write(&req.device_sn, &names, &values).await {
        Ok(()) => ok(()),
        Err(e) => control_error(e),
    }
}
