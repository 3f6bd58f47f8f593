//! Registry API module
//!
//! 注册中心按层拆分：
//! - `service`: 核心校验与存储委托逻辑
//! - `http`: JSON API 路由与处理器
//! - `ws`: 变更事件的 WebSocket 推送端点

pub mod http;
pub mod service;
pub mod ws;

pub use http::{registry_router, RegistryState};
pub use service::{build_registry, RegistryError, RegistryService};
