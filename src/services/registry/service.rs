use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{InstanceRecord, InstanceStatus, RegisterRequest};
use crate::services::feed::ChangeFeed;
use crate::services::store::{InstanceStore, StoreBackend, StoreError};

/// 注册中心错误。校验失败是客户端错误，不重试；
/// 5xx 对调用方是不确定结局，靠 instance_id 幂等重试。
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BindingChanged(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ServiceBindingChanged { .. } => RegistryError::BindingChanged(e.to_string()),
        }
    }
}

/// 注册中心的请求/应答门面：校验、分配 ID、委托存储、经变更源发事件
pub struct RegistryService {
    store: Arc<InstanceStore>,
}

impl RegistryService {
    pub fn new(store: Arc<InstanceStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<InstanceStore> {
        self.store.clone()
    }

    pub fn feed(&self) -> Arc<ChangeFeed> {
        self.store.feed()
    }

    /// 注册实例。重试同一次注册可以带上已分配的 ID，
    /// 只要服务名一致就按幂等 upsert 处理。
    pub fn register(&self, req: RegisterRequest) -> Result<Uuid, RegistryError> {
        Self::validate(&req)?;

        let instance_id = req.instance_id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();
        let record = InstanceRecord {
            instance_id,
            service_name: req.service_name.clone(),
            host: req.host.clone(),
            port: req.port,
            version_tag: req.version.clone(),
            metadata: req.metadata.clone(),
            health_check_url: req.health_check_url.clone(),
            weight: req.weight,
            registered_at: now,
            last_heartbeat: now,
            status: InstanceStatus::Healthy,
        };

        let version = self.store.upsert(record)?;
        tracing::info!(
            service_name = %req.service_name,
            instance_id = %instance_id,
            host = %req.host,
            port = %req.port,
            weight = %req.weight,
            version = %version,
            "Registered service instance"
        );
        Ok(instance_id)
    }

    /// 注销实例，幂等：不存在时报告 NotFound 但不改变任何状态
    pub fn deregister(&self, instance_id: &Uuid) -> Result<(), RegistryError> {
        let (removed, version) = self.store.remove(instance_id);
        if !removed {
            return Err(RegistryError::NotFound(format!(
                "instance {} not found",
                instance_id
            )));
        }

        tracing::info!(instance_id = %instance_id, version = %version, "Deregistered service instance");
        Ok(())
    }

    /// 心跳。实例不存在或服务名不匹配都报 NotFound，
    /// 服务名校验防止跨服务的心跳污染。
    pub fn heartbeat(&self, instance_id: &Uuid, service_name: &str) -> Result<(), RegistryError> {
        let record = self
            .store
            .get(instance_id)
            .ok_or_else(|| RegistryError::NotFound(format!("instance {} not found", instance_id)))?;

        if record.service_name != service_name {
            tracing::warn!(
                instance_id = %instance_id,
                registered_service = %record.service_name,
                claimed_service = %service_name,
                "Rejected heartbeat with mismatched service name"
            );
            return Err(RegistryError::NotFound(format!(
                "instance {} not found for service '{}'",
                instance_id, service_name
            )));
        }

        if !self.store.touch(instance_id) {
            return Err(RegistryError::NotFound(format!(
                "instance {} not found",
                instance_id
            )));
        }
        Ok(())
    }

    /// 按服务名查询实例快照
    pub fn discover(
        &self,
        service_name: &str,
        version_filter: Option<&str>,
        healthy_only: bool,
    ) -> Vec<InstanceRecord> {
        let mut instances = self.store.list_by_service(service_name);
        if let Some(version) = version_filter {
            instances.retain(|r| r.version_tag == version);
        }
        if healthy_only {
            instances.retain(|r| r.status == InstanceStatus::Healthy);
        }
        instances.sort_by_key(|r| r.instance_id);
        instances
    }

    /// 服务端均匀挑一个健康实例（调用方通常优先用本地负载均衡）
    pub fn pick(&self, service_name: &str, version_filter: Option<&str>) -> Option<InstanceRecord> {
        let candidates: Vec<InstanceRecord> = self
            .discover(service_name, version_filter, true)
            .into_iter()
            .filter(|r| r.is_selectable())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }

    pub fn list_names(&self) -> Vec<String> {
        self.store.list_all_names()
    }

    pub fn list_all(&self) -> Vec<InstanceRecord> {
        self.store.list_all()
    }

    fn validate(req: &RegisterRequest) -> Result<(), RegistryError> {
        if req.service_name.trim().is_empty() {
            return Err(RegistryError::Validation(
                "serviceName must not be empty".to_string(),
            ));
        }
        if req.host.trim().is_empty() {
            return Err(RegistryError::Validation(
                "host must not be empty".to_string(),
            ));
        }
        if req.port == 0 {
            return Err(RegistryError::Validation(
                "port must be in range 1..=65535".to_string(),
            ));
        }
        if req.metadata.keys().any(|k| k.trim().is_empty()) {
            return Err(RegistryError::Validation(
                "metadata keys must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// 组装一套注册中心（变更源 + 存储 + 门面），测试与服务端共用
pub fn build_registry(channel_capacity: usize) -> (Arc<RegistryService>, Arc<InstanceStore>) {
    let feed = Arc::new(ChangeFeed::new(channel_capacity));
    let store = Arc::new(InstanceStore::new(feed));
    let registry = Arc::new(RegistryService::new(store.clone()));
    (registry, store)
}
