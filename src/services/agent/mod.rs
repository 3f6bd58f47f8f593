//! Service agent module
//!
//! 后端进程内的代理：
//! - `identity`: 两阶段身份解析（显式配置 > provider > 平台自省）
//! - `runtime`: 注册重试、失败策略、心跳与优雅注销
//! - `adaptive`: 基于请求指标窗口的心跳节奏控制
//! - `health`: 可选的默认健康检查端点

pub mod adaptive;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod runtime;

pub use adaptive::{AdaptiveConfig, HeartbeatController, LoadLevel, MetricsWindow, WindowStats};
pub use config::{AgentConfig, AgentConfigBuilder, FailurePolicy};
pub use error::AgentError;
pub use health::HealthEndpoint;
pub use identity::{ServiceIdentity, ServiceInfoProvider};
pub use runtime::ServiceAgent;
