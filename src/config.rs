use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::services::balancer::BalancerPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub discovery: DiscoveryConfig,
    pub proxy: ProxyConfig,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_str = fs::read_to_string("config.toml")?;
        let config: Config = toml::from_str(&config_str)?;
        Ok(config)
    }

    /// 配置文件缺失时退回默认值
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config.toml, using defaults");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
        }
    }
}

/// 注册中心的时间参数与变更源设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 心跳超时（秒），超过后实例降级为 Unhealthy
    pub miss_timeout: u64,
    /// 驱逐超时（秒），超过后实例被移除
    pub evict_timeout: u64,
    /// 过期扫描周期（秒）
    pub sweep_interval: u64,
    /// 主动探测周期（秒）
    pub probe_interval: u64,
    /// 单次探测超时（秒）
    pub probe_timeout: u64,
    /// 推送广播通道容量
    pub channel_capacity: usize,
    /// 删除墓碑的保留时间（秒），更早的版本只能走全量快照
    pub tombstone_retention: u64,
    /// 停机时订阅者的排空宽限期（秒）
    pub subscriber_drain: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            miss_timeout: 60,
            evict_timeout: 120,
            sweep_interval: 5,
            probe_interval: 30,
            probe_timeout: 5,
            channel_capacity: 1024,
            tombstone_retention: 600, // 10分钟
            subscriber_drain: 5,
        }
    }
}

impl RegistryConfig {
    pub fn miss_timeout(&self) -> Duration {
        Duration::from_secs(self.miss_timeout)
    }

    pub fn evict_timeout(&self) -> Duration {
        Duration::from_secs(self.evict_timeout)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention)
    }

    pub fn subscriber_drain(&self) -> Duration {
        Duration::from_secs(self.subscriber_drain)
    }
}

/// 调用方本地发现缓存的维护参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub registry_url: String,
    /// 增量拉取周期（秒）
    pub sync_interval: u64,
    /// 拉取请求超时（秒）
    pub request_timeout: u64,
    /// 批量应用周期（毫秒）
    pub batch_interval_ms: u64,
    /// 队列深度达到该值时立即应用
    pub batch_threshold: usize,
    /// 推送事件队列容量
    pub queue_capacity: usize,
    /// 是否启用推送通道（关闭后仅靠拉取收敛）
    pub enable_push: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            registry_url: "http://localhost:5000".to_string(),
            sync_interval: 5,
            request_timeout: 10,
            batch_interval_ms: 100,
            batch_threshold: 100,
            queue_capacity: 4096,
            enable_push: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// 推送通道地址（http -> ws）
    pub fn push_url(&self) -> String {
        let base = self
            .registry_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/ws/registry", base.trim_end_matches('/'))
    }

    pub fn changes_url(&self, since: u64) -> String {
        format!(
            "{}/api/registry/changes?sinceVersion={}",
            self.registry_url.trim_end_matches('/'),
            since
        )
    }
}

/// 动态代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// 路由前缀集合，按部署配置，大小写不敏感
    pub route_prefixes: Vec<String>,
    pub balancer: BalancerPolicy,
    /// 常规请求超时（秒）
    pub request_timeout: u64,
    /// 大传输请求超时（秒）
    pub large_transfer_timeout: u64,
    /// Content-Length 超过该值按大传输处理（字节）
    pub large_transfer_threshold: u64,
    pub breaker: BreakerConfig,
    pub pool: PoolConfig,
    /// 停机时在途请求的排空上限（秒）
    pub drain_timeout: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            route_prefixes: vec![
                "svc".to_string(),
                "api".to_string(),
                "gateway".to_string(),
            ],
            balancer: BalancerPolicy::RoundRobin,
            request_timeout: 10,
            large_transfer_timeout: 1800, // 30分钟
            large_transfer_threshold: 10 * 1024 * 1024,
            breaker: BreakerConfig::default(),
            pool: PoolConfig::default(),
            drain_timeout: 30,
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn large_transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.large_transfer_timeout)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}

/// 每个目标实例一个熔断器
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// 初始打开时长（秒）
    pub open_duration: u64,
    /// 反复失败时打开时长的上限（秒）
    pub max_open_duration: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: 30,
            max_open_duration: 300, // 5分钟
        }
    }
}

impl BreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration)
    }

    pub fn max_open_duration(&self) -> Duration {
        Duration::from_secs(self.max_open_duration)
    }
}

/// 上游连接池。常规池与大传输池分开，避免大文件占满通用连接。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub general_max_idle_per_host: usize,
    pub general_idle_timeout: u64,
    pub general_keepalive: u64,
    pub large_max_idle_per_host: usize,
    pub large_idle_timeout: u64,
    pub large_keepalive: u64,
    pub connect_timeout: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            general_max_idle_per_host: 100,
            general_idle_timeout: 120, // 2分钟
            general_keepalive: 60,
            large_max_idle_per_host: 20,
            large_idle_timeout: 600, // 10分钟
            large_keepalive: 30,
            connect_timeout: 10,
        }
    }
}
