//! HTTP 响应辅助函数
//!
//! 所有错误统一返回 `ApiResponse` 格式，HTTP 状态码与错误码一一对应。

use api_contract::{ApiResponse, codes};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use gw_control::ControlError;
use gw_protocol::ProtocolError;
use serde::Serialize;

pub fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse::success(data)).into_response()
}

fn error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(ApiResponse::<()>::error(code, message))).into_response()
}

/// 错误请求响应
pub fn bad_request_error(message: impl Into<String>) -> Response {
    error(StatusCode::BAD_REQUEST, codes::INVALID_REQUEST, message)
}

/// 资源未找到错误响应
pub fn not_found_error(message: impl Into<String>) -> Response {
    error(StatusCode::NOT_FOUND, codes::NOT_FOUND, message)
}

/// 配置更新被拒绝
pub fn config_error(message: impl Into<String>) -> Response {
    error(StatusCode::BAD_REQUEST, codes::CONFIG_INVALID, message)
}

pub fn internal_error(message: impl Into<String>) -> Response {
    error(StatusCode::INTERNAL_SERVER_ERROR, codes::INTERNAL, message)
}

/// 下发链路错误响应
///
/// | 错误 | 状态码 |
/// |---|---|
/// | 参数非法 / 协议不支持该操作 | 400 |
/// | 设备、点位或插件不存在 | 404 |
/// | 编码、连接、设备应答失败 | 502 |
pub fn control_error(err: ControlError) -> Response {
    let message = err.to_string();
    match err {
        ControlError::BadRequest(_) => bad_request_error(message),
        ControlError::NotFound(_) | ControlError::Protocol(ProtocolError::NotFound(_)) => {
            not_found_error(message)
        }
        ControlError::Protocol(ProtocolError::UnsupportedOperation(_)) => bad_request_error(message),
        ControlError::Protocol(_) => error(StatusCode::BAD_GATEWAY, codes::SEND_FAILED, message),
        ControlError::Config(_) | ControlError::Mqtt(_) => internal_error(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_errors_map_to_status() {
        let cases = [
            (ControlError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ControlError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                ControlError::Protocol(ProtocolError::NotFound("x".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                ControlError::Protocol(ProtocolError::UnsupportedOperation("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ControlError::Protocol(ProtocolError::Timeout("x".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (ControlError::Mqtt("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(control_error(err).status(), status);
        }
    }
}
