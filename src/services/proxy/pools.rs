use std::time::Duration;

use axum::http::{header, HeaderMap};

use crate::config::{PoolConfig, ProxyConfig};

/// 双连接池。常规池面向短请求（HTTP/2、较长空闲），
/// 大传输池单独隔离（HTTP/1.1、较短保活），按 Content-Length 启发式选择。
#[derive(Debug, Clone)]
pub struct UpstreamPools {
    general: reqwest::Client,
    large: reqwest::Client,
    large_threshold: u64,
}

impl UpstreamPools {
    pub fn new(proxy: &ProxyConfig) -> Self {
        let pool = &proxy.pool;
        Self {
            general: build_general(pool),
            large: build_large(pool),
            large_threshold: proxy.large_transfer_threshold,
        }
    }

    /// 按大传输启发式挑选客户端与请求限期
    pub fn select(&self, headers: &HeaderMap, proxy: &ProxyConfig) -> (&reqwest::Client, Duration) {
        if self.is_large_transfer(headers) {
            (&self.large, proxy.large_transfer_timeout())
        } else {
            (&self.general, proxy.request_timeout())
        }
    }

    pub fn is_large_transfer(&self, headers: &HeaderMap) -> bool {
        content_length(headers)
            .map(|len| len > self.large_threshold)
            .unwrap_or(false)
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn build_general(pool: &PoolConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(pool.general_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(pool.general_idle_timeout))
        .tcp_keepalive(Duration::from_secs(pool.general_keepalive))
        .connect_timeout(Duration::from_secs(pool.connect_timeout))
        .build()
        .unwrap_or_default()
}

fn build_large(pool: &PoolConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(pool.large_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(pool.large_idle_timeout))
        .tcp_keepalive(Duration::from_secs(pool.large_keepalive))
        .connect_timeout(Duration::from_secs(pool.connect_timeout))
        .http1_only()
        .build()
        .unwrap_or_default()
}
