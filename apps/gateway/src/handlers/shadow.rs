//! 设备影子查询

use api_contract::{DevicePointDto, ShadowQuery};
use axum::{
    extract::{Query, State},
    response::Response,
};
use serde_json::Value;

use super::current_epoch;
use crate::AppState;
use crate::response::{bad_request_error, not_found_error, ok};

/// GET /shadow/all
pub async fn shadow_all(State(state): State<AppState>) -> Response {
    match current_epoch(&state) {
        Ok(epoch) => ok(epoch.shadow().snapshots()),
        Err(response) => response,
    }
}

/// GET /shadow/device?id=
pub async fn shadow_device(
    State(state): State<AppState>,
    Query(query): Query<ShadowQuery>,
) -> Response {
    let epoch = match current_epoch(&state) {
        Ok(epoch) => epoch,
        Err(response) => return response,
    };
    match epoch.shadow().device_snapshot(&query.id) {
        Some(snapshot) => ok(snapshot),
        None => not_found_error(format!("device {}", query.id)),
    }
}

/// GET /shadow/devicePoint?id=&point=
pub async fn shadow_device_point(
    State(state): State<AppState>,
    Query(query): Query<ShadowQuery>,
) -> Response {
    let epoch = match current_epoch(&state) {
        Ok(epoch) => epoch,
        Err(response) => return response,
    };
    let Some(point_name) = query.point.filter(|p| !p.is_empty()) else {
        return bad_request_error("point is required");
    };
    let Some(snapshot) = epoch.shadow().device_snapshot(&query.id) else {
        return not_found_error(format!("device {}", query.id));
    };
    let Some(point) = snapshot.points.get(&point_name) else {
        return not_found_error(format!("point {point_name} on device {}", query.id));
    };
    ok(DevicePointDto {
        device_sn: query.id,
        value: point.value.as_ref().map(|v| v.to_json()).unwrap_or(Value::Null),
        updated_at_ms: point.updated_at_ms,
        point_name,
    })
}
