use thiserror::Error;

/// 服务代理侧错误类型
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    /// 校验被拒绝，不重试
    #[error("registration rejected: {0}")]
    Rejected(String),
    /// 实例 ID 已绑定到其他服务，属于致命配置错误
    #[error("service binding changed: {0}")]
    BindingChanged(String),
    /// 心跳对端查无此实例，应重新注册
    #[error("instance not found at registry")]
    NotFound,
    #[error("registry returned unexpected status {0}")]
    Unexpected(reqwest::StatusCode),
    #[error("agent is not registered")]
    NotRegistered,
    #[error("service identity incomplete: {0}")]
    Identity(String),
    #[error("registration retries exhausted: {0}")]
    RetriesExhausted(String),
}

impl AgentError {
    /// 致命错误不进入重试循环
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Rejected(_) | AgentError::BindingChanged(_) | AgentError::Identity(_)
        )
    }
}
