//! Discovery cache module
//!
//! 调用方本地的注册表镜像：
//! - `cache`: 两张映射 + 版本游标，增量拉取与批量应用
//! - `push`: WebSocket 推送通道消费者

pub mod cache;
mod push;

pub use cache::{CacheError, CacheStats, DiscoveryCache, ServiceSubscriber};
