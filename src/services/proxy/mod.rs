//! Dynamic proxy module
//!
//! 动态反向代理按职责拆分：
//! - `extractor`: 前缀 + 服务名路径解析
//! - `breaker`: 按目标实例隔离的三态熔断器
//! - `pools`: 常规 / 大传输双连接池
//! - `forwarder`: 流式转发与连接级头过滤
//! - `service`: 解析、选择、熔断、限期的请求流水线

pub mod breaker;
pub mod error;
pub mod extractor;
pub mod forwarder;
pub mod pools;
pub mod response;
pub mod service;

pub use breaker::{Admission, BreakerRegistry, BreakerState, CircuitBreaker};
pub use error::ProxyError;
pub use extractor::{extract_route, is_proxy_path, RouteTarget};
pub use service::{proxy_fallback, ProxyService, ProxyStats};
