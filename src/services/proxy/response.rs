use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;

use super::error::ProxyError;

/// 统一的代理错误应答：{error, message, service}
pub fn error_response(error: &ProxyError, service: &str) -> Response {
    let status = error.status_code();
    let body = serde_json::json!({
        "error": error.kind(),
        "message": error.to_string(),
        "service": service,
    });

    tracing::debug!(
        service_name = %service,
        error_kind = %error.kind(),
        status = %status,
        "Returning proxy error response"
    );

    match Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
    {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build error response");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}
