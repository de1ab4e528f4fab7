//! HTTP 请求上下文：request_id 由外层 `SetRequestIdLayer` 生成或沿用上游，
//! trace_id 沿用 `x-trace-id`，缺失时新建。请求结束后按状态码记一条访问日志。

use std::time::Instant;

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use gw_telemetry::new_trace_id;
use tower_http::request_id::RequestId;
use tracing::{Instrument, info, info_span, warn};

pub const TRACE_ID: HeaderName = HeaderName::from_static("x-trace-id");

fn header_str(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub async fn request_context(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .unwrap_or_default()
        .to_string();
    let trace_id = header_str(req.headers(), &TRACE_ID).unwrap_or_else(new_trace_id);
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = info_span!(
        target: "gw.http",
        "http",
        request_id = %request_id,
        trace_id = %trace_id,
        method = %method,
        path = %path
    );
    let started = Instant::now();
    let mut response = next.run(req).instrument(span.clone()).await;
    let status = response.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    span.in_scope(|| {
        if response.status().is_server_error() {
            warn!(target: "gw.http", status, elapsed_ms, "request failed");
        } else {
            info!(target: "gw.http", status, elapsed_ms, "request served");
        }
    });

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID, value);
    }
    response
}
