use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 实例健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Offline,
}

/// 服务实例记录（注册表中的唯一持久实体）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub instance_id: Uuid,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    /// 自由格式的版本串，线上字段名为 version
    #[serde(rename = "version", default)]
    pub version_tag: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
}

fn default_weight() -> u32 {
    100
}

impl InstanceRecord {
    /// 实例的基础 URL（IPv6 地址加方括号）
    pub fn base_url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    /// 健康探测目标，缺省为 /health
    pub fn probe_url(&self) -> String {
        match &self.health_check_url {
            Some(url) => url.clone(),
            None => format!("{}/health", self.base_url()),
        }
    }

    /// 是否可以被负载均衡选中（权重为 0 的实例只注册不参与选择）
    pub fn is_selectable(&self) -> bool {
        self.status == InstanceStatus::Healthy && self.weight > 0
    }
}

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Upsert,
    Remove,
}

/// 注册表变更事件，携带产生它的那次变更的版本号
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceChangeEvent {
    pub instance_id: Uuid,
    pub service_name: String,
    pub kind: ChangeKind,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<InstanceRecord>,
}

// ---- 注册表线上协议 (JSON, camelCase, 未知字段忽略) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// 重试同一次注册时带上已分配的 ID，保证幂等
    #[serde(default)]
    pub instance_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub instance_id: Uuid,
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    pub service_name: String,
    pub instances: Vec<InstanceRecord>,
}

/// 增量变更应答。sinceVersion 早于保留下界时返回全量快照，
/// fullSnapshot 置位，调用方必须重置本地状态后再应用。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    pub version: u64,
    pub added_or_updated: Vec<InstanceRecord>,
    pub removed: Vec<Uuid>,
    #[serde(default)]
    pub full_snapshot: bool,
}
