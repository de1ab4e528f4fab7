//! 稳定的 REST DTO 与 API 响应契约。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 错误码。
pub mod codes {
    pub const INVALID_REQUEST: &str = "INVALID.REQUEST";
    pub const NOT_FOUND: &str = "RESOURCE.NOT_FOUND";
    pub const SEND_FAILED: &str = "DEVICE.SEND_FAILED";
    pub const CONFIG_INVALID: &str = "CONFIG.INVALID";
    pub const INTERNAL: &str = "INTERNAL.ERROR";
}

/// 标准 API 响应封装。
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

/// 失败响应的错误体。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// `POST /device/readPoints`、`POST /device/writePoints` 请求体。
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePointsRequest {
    #[serde(alias = "id")]
    pub device_sn: String,
    pub points: Vec<PointItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointItem {
    pub point_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// `GET /shadow/device`、`GET /shadow/devicePoint` 查询参数。
#[derive(Debug, Deserialize)]
pub struct ShadowQuery {
    pub id: String,
    pub point: Option<String>,
}

/// `/plugin/cache/*` 查询参数。
#[derive(Debug, Deserialize)]
pub struct CacheQuery {
    pub key: String,
}

/// 单点影子值。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePointDto {
    pub device_sn: String,
    pub point_name: String,
    pub value: Value,
    pub updated_at_ms: i64,
}

/// `GET /health` 响应体。
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDto {
    pub status: String,
    pub connectors: usize,
    pub devices: usize,
    pub online: usize,
}

/// `POST /config/update` 响应体。
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdateDto {
    pub key: String,
    pub connectors: usize,
    pub devices: usize,
}
