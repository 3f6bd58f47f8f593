use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{InstanceRecord, InstanceStatus};
use crate::services::feed::ChangeFeed;

/// 存储层错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 实例 ID 已绑定到其他服务；换绑必须先注销再注册
    #[error("instance {instance_id} is bound to service '{current}', cannot rebind to '{requested}'")]
    ServiceBindingChanged {
        instance_id: Uuid,
        current: String,
        requested: String,
    },
}

/// 存储统计信息
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub upserts: u64,
    pub removals: u64,
    pub touches: u64,
    pub status_changes: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    instances: HashMap<Uuid, InstanceRecord>,
    by_service: HashMap<String, HashSet<Uuid>>,
    version: u64,
    stats: StoreStats,
}

impl StoreState {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}

/// 实例存储的抽象契约。内存实现是规范实现；
/// 持久化后端（TTL + 发布订阅语义）实现同一契约即可替换。
pub trait StoreBackend: Send + Sync {
    fn upsert(&self, record: InstanceRecord) -> Result<u64, StoreError>;
    fn remove(&self, instance_id: &Uuid) -> (bool, u64);
    fn touch(&self, instance_id: &Uuid) -> bool;
    fn set_status(&self, instance_id: &Uuid, status: InstanceStatus) -> bool;
    fn get(&self, instance_id: &Uuid) -> Option<InstanceRecord>;
    fn list_by_service(&self, service_name: &str) -> Vec<InstanceRecord>;
    fn list_all(&self) -> Vec<InstanceRecord>;
    fn list_all_names(&self) -> Vec<String>;
    fn list_expired(&self, threshold: Duration) -> Vec<InstanceRecord>;
    fn version(&self) -> u64;
}

/// 权威的内存实例存储。所有变更在同一把锁内完成版本递增并
/// 先写入变更源再返回，读路径返回快照。
pub struct InstanceStore {
    state: RwLock<StoreState>,
    feed: Arc<ChangeFeed>,
}

impl InstanceStore {
    pub fn new(feed: Arc<ChangeFeed>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            feed,
        }
    }

    pub fn feed(&self) -> Arc<ChangeFeed> {
        self.feed.clone()
    }

    pub fn stats(&self) -> StoreStats {
        self.state.read().unwrap().stats.clone()
    }
}

impl StoreBackend for InstanceStore {
    /// 写入或更新实例。同一 ID 换服务名被拒绝。
    fn upsert(&self, mut record: InstanceRecord) -> Result<u64, StoreError> {
        let mut state = self.state.write().unwrap();

        if let Some(existing) = state.instances.get(&record.instance_id) {
            if existing.service_name != record.service_name {
                return Err(StoreError::ServiceBindingChanged {
                    instance_id: record.instance_id,
                    current: existing.service_name.clone(),
                    requested: record.service_name.clone(),
                });
            }
            // 注册时间以首次为准
            record.registered_at = existing.registered_at;
        }
        if record.last_heartbeat < record.registered_at {
            record.last_heartbeat = record.registered_at;
        }

        let version = state.next_version();
        state
            .by_service
            .entry(record.service_name.clone())
            .or_default()
            .insert(record.instance_id);
        state.instances.insert(record.instance_id, record.clone());
        state.stats.upserts += 1;

        self.feed.record_upsert(version, record);
        Ok(version)
    }

    /// 移除实例。不存在时不改变状态也不递增版本。
    fn remove(&self, instance_id: &Uuid) -> (bool, u64) {
        let mut state = self.state.write().unwrap();

        let record = match state.instances.remove(instance_id) {
            Some(record) => record,
            None => return (false, state.version),
        };

        if let Some(ids) = state.by_service.get_mut(&record.service_name) {
            ids.remove(instance_id);
            if ids.is_empty() {
                state.by_service.remove(&record.service_name);
            }
        }

        let version = state.next_version();
        state.stats.removals += 1;

        self.feed
            .record_remove(version, *instance_id, record.service_name);
        (true, version)
    }

    /// 心跳触达：刷新 last_heartbeat 并恢复 Healthy
    fn touch(&self, instance_id: &Uuid) -> bool {
        let mut state = self.state.write().unwrap();

        let mut record = match state.instances.get(instance_id) {
            Some(record) => record.clone(),
            None => return false,
        };
        record.last_heartbeat = Utc::now();
        record.status = InstanceStatus::Healthy;

        let version = state.next_version();
        state.instances.insert(*instance_id, record.clone());
        state.stats.touches += 1;

        self.feed.record_upsert(version, record);
        true
    }

    /// 状态写入是幂等的：相同状态不产生新版本
    fn set_status(&self, instance_id: &Uuid, status: InstanceStatus) -> bool {
        let mut state = self.state.write().unwrap();

        let mut record = match state.instances.get(instance_id) {
            Some(record) => record.clone(),
            None => return false,
        };
        if record.status == status {
            return true;
        }
        record.status = status;

        let version = state.next_version();
        state.instances.insert(*instance_id, record.clone());
        state.stats.status_changes += 1;

        self.feed.record_upsert(version, record);
        true
    }

    fn get(&self, instance_id: &Uuid) -> Option<InstanceRecord> {
        self.state
            .read()
            .unwrap()
            .instances
            .get(instance_id)
            .cloned()
    }

    /// 返回服务下所有实例的快照，调用方不得假设其存活
    fn list_by_service(&self, service_name: &str) -> Vec<InstanceRecord> {
        let state = self.state.read().unwrap();
        match state.by_service.get(service_name) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| state.instances.get(id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    fn list_all(&self) -> Vec<InstanceRecord> {
        self.state
            .read()
            .unwrap()
            .instances
            .values()
            .cloned()
            .collect()
    }

    fn list_all_names(&self) -> Vec<String> {
        let state = self.state.read().unwrap();
        let mut names: Vec<String> = state.by_service.keys().cloned().collect();
        names.sort();
        names
    }

    /// 列出心跳超过阈值的实例
    fn list_expired(&self, threshold: Duration) -> Vec<InstanceRecord> {
        let now = Utc::now();
        let threshold =
            chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::MAX);
        self.state
            .read()
            .unwrap()
            .instances
            .values()
            .filter(|record| now - record.last_heartbeat > threshold)
            .cloned()
            .collect()
    }

    fn version(&self) -> u64 {
        self.state.read().unwrap().version
    }
}
