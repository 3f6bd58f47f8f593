use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::adaptive::AdaptiveConfig;

/// 注册失败策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// 传播致命错误，终止进程
    FailFast,
    /// 不带注册继续运行，不发心跳
    ContinueWithoutRegistration,
    /// 后台无限重试，注册成功后开始心跳
    ContinueAndRetry,
}

/// 服务代理配置。身份解析完成后配置不再变化。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub registry_url: String,
    pub service_name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub version: String,
    pub weight: u32,
    pub metadata: HashMap<String, String>,
    pub health_check_url: Option<String>,
    /// 基础心跳周期（秒），自适应控制器以此为 Normal 档
    pub heartbeat_interval: u64,
    pub auto_register: bool,
    /// 前台注册重试次数，0 表示不设上限
    pub register_retry_count: u32,
    /// 注册重试间隔（秒）
    pub register_retry_interval: u64,
    pub failure_policy: FailurePolicy,
    /// 打开后宿主应用挂载默认健康检查端点
    pub enable_default_health_check: bool,
    pub health_check_path: String,
    pub adaptive: AdaptiveConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            registry_url: "http://localhost:5000".to_string(),
            service_name: None,
            host: None,
            port: None,
            version: String::new(),
            weight: 100,
            metadata: HashMap::new(),
            health_check_url: None,
            heartbeat_interval: 30,
            auto_register: true,
            register_retry_count: 3,
            register_retry_interval: 5,
            failure_policy: FailurePolicy::ContinueAndRetry,
            enable_default_health_check: false,
            health_check_path: "/health".to_string(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn register_retry_interval(&self) -> Duration {
        Duration::from_secs(self.register_retry_interval)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn register_url(&self) -> String {
        format!(
            "{}/api/registry/register",
            self.registry_url.trim_end_matches('/')
        )
    }

    pub fn heartbeat_url(&self) -> String {
        format!(
            "{}/api/registry/heartbeat",
            self.registry_url.trim_end_matches('/')
        )
    }

    pub fn deregister_url(&self, instance_id: &uuid::Uuid) -> String {
        format!(
            "{}/api/registry/deregister/{}",
            self.registry_url.trim_end_matches('/'),
            instance_id
        )
    }
}

/// 链式构造器，便于在宿主应用里内联配置
#[derive(Debug, Default)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
        }
    }

    pub fn registry_url(mut self, url: impl Into<String>) -> Self {
        self.config.registry_url = url.into();
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = Some(name.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.config.weight = weight;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.metadata.insert(key.into(), value.into());
        self
    }

    pub fn health_check_url(mut self, url: impl Into<String>) -> Self {
        self.config.health_check_url = Some(url.into());
        self
    }

    pub fn heartbeat_interval(mut self, secs: u64) -> Self {
        self.config.heartbeat_interval = secs;
        self
    }

    pub fn auto_register(mut self, enabled: bool) -> Self {
        self.config.auto_register = enabled;
        self
    }

    pub fn register_retry(mut self, count: u32, interval_secs: u64) -> Self {
        self.config.register_retry_count = count;
        self.config.register_retry_interval = interval_secs;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn enable_default_health_check(mut self, enabled: bool) -> Self {
        self.config.enable_default_health_check = enabled;
        self
    }

    pub fn build(self) -> AgentConfig {
        self.config
    }
}
