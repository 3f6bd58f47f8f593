use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Method, Response};

use super::error::ProxyError;

// RFC 7230 连接级头，不得跨跳转发
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// 过滤出站请求头：剥掉连接级头与 Host，其余（含 Content-*）原样携带
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) || name == header::HOST {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// 把请求转发到目标实例并以 headers-first 模式返回：
/// 状态与响应头到达即返回，请求体与响应体全程流式透传，从不整体缓冲。
pub async fn forward(
    client: &reqwest::Client,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Body,
    deadline: Duration,
) -> Result<Response<Body>, ProxyError> {
    let outbound = client
        .request(method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .timeout(deadline);

    // 限期覆盖整个上游调用；调用方断开时本 future 被丢弃，上游请求随之取消
    let upstream = tokio::time::timeout(deadline, outbound.send())
        .await
        .map_err(|_| ProxyError::Timeout(deadline.as_secs()))?
        .map_err(|e| {
            if e.is_timeout() {
                ProxyError::Timeout(deadline.as_secs())
            } else {
                ProxyError::Transport(e.to_string())
            }
        })?;

    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers().iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name, value);
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ProxyError::Internal(format!("failed to build response: {}", e)))
}
