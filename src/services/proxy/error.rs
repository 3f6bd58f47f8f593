use axum::http::StatusCode;
use thiserror::Error;

/// 代理错误分类。kind 作为应答 JSON 里的 error 字段，
/// 状态码映射：502 传输失败 / 503 无实例或熔断 / 504 超时。
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no healthy instance available for service '{0}'")]
    ServiceUnavailable(String),
    #[error("circuit open for service '{0}'")]
    CircuitOpen(String),
    #[error("upstream call timed out after {0} seconds")]
    Timeout(u64),
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("invalid proxy path: {0}")]
    InvalidPath(String),
    #[error("internal proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::ServiceUnavailable(_) => "ServiceUnavailable",
            ProxyError::CircuitOpen(_) => "CircuitOpen",
            ProxyError::Timeout(_) => "Timeout",
            ProxyError::Transport(_) => "TransientNetwork",
            ProxyError::InvalidPath(_) => "Validation",
            ProxyError::Internal(_) => "Internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::ServiceUnavailable(_) | ProxyError::CircuitOpen(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidPath(_) => StatusCode::NOT_FOUND,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 是否计入熔断器失败计数（CircuitOpen 本身不计）
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Timeout(_) | ProxyError::Transport(_) | ProxyError::Internal(_)
        )
    }
}
