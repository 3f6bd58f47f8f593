use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::DiscoveryConfig;
use crate::models::{ChangeKind, ChangesResponse, InstanceRecord, InstanceStatus, ServiceChangeEvent};
use crate::services::balancer::LoadBalancer;

use super::push::spawn_push_consumer;

/// 发现缓存错误
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("registry pull failed: {0}")]
    Pull(#[from] reqwest::Error),
    #[error("registry pull returned status {0}")]
    PullStatus(reqwest::StatusCode),
}

/// 服务订阅回调：健康实例集合变化时收到当前健康列表
pub type ServiceSubscriber = Arc<dyn Fn(&str, &[InstanceRecord]) + Send + Sync>;

/// 缓存统计信息
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub pulls: u64,
    pub pull_failures: u64,
    pub push_events: u64,
    pub push_dropped: u64,
    pub batches_applied: u64,
    pub full_resets: u64,
    pub notifications: u64,
}

/// 调用方本地的注册表镜像。
/// 维护三条路径：周期增量拉取（收敛的权威来源）、
/// 尽力而为的推送通道、以及合并后的批量应用。
/// 查询永远走本地状态，不阻塞在网络上。
pub struct DiscoveryCache {
    config: DiscoveryConfig,
    instances: DashMap<Uuid, InstanceRecord>,
    by_service: DashMap<String, HashSet<Uuid>>,
    /// 小写服务名 -> 原始服务名，代理按大小写不敏感匹配
    name_index: DashMap<String, String>,
    /// 每个实例已应用的最高版本，按版本做“最后写入者胜”
    applied_versions: DashMap<Uuid, u64>,
    version: AtomicU64,
    balancer: LoadBalancer,
    subscribers: DashMap<String, Vec<ServiceSubscriber>>,
    healthy_view: DashMap<String, BTreeSet<Uuid>>,
    queue_tx: mpsc::Sender<ServiceChangeEvent>,
    queue_rx: Mutex<Option<mpsc::Receiver<ServiceChangeEvent>>>,
    http: reqwest::Client,
    task_tracker: TaskTracker,
    shutdown: CancellationToken,
    stats: Mutex<CacheStats>,
}

impl DiscoveryCache {
    pub fn new(
        config: DiscoveryConfig,
        balancer: LoadBalancer,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();

        Arc::new(Self {
            config,
            instances: DashMap::new(),
            by_service: DashMap::new(),
            name_index: DashMap::new(),
            applied_versions: DashMap::new(),
            version: AtomicU64::new(0),
            balancer,
            subscribers: DashMap::new(),
            healthy_view: DashMap::new(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            http,
            task_tracker: TaskTracker::new(),
            shutdown,
            stats: Mutex::new(CacheStats::default()),
        })
    }

    /// 启动维护任务：增量拉取、批量应用、推送消费
    pub fn start(self: &Arc<Self>) {
        self.spawn_pull_loop();
        self.spawn_batch_applier();
        if self.config.enable_push {
            spawn_push_consumer(self.clone());
        }
    }

    pub(super) fn tracker(&self) -> &TaskTracker {
        &self.task_tracker
    }

    pub(super) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(super) fn push_url(&self) -> String {
        self.config.push_url()
    }

    /// 本地版本游标
    pub fn local_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// 本地查询，不触网
    pub fn discover(
        &self,
        service_name: &str,
        version_filter: Option<&str>,
        healthy_only: bool,
    ) -> Vec<InstanceRecord> {
        let canonical = match self.canonical_name(service_name) {
            Some(name) => name,
            None => return Vec::new(),
        };

        let ids = match self.by_service.get(&canonical) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };

        let mut records: Vec<InstanceRecord> = ids
            .iter()
            .filter_map(|id| self.instances.get(id).map(|r| r.value().clone()))
            .collect();

        if let Some(version) = version_filter {
            records.retain(|r| r.version_tag == version);
        }
        if healthy_only {
            records.retain(|r| r.status == InstanceStatus::Healthy);
        }
        // 排序保证轮询在稳定集合上逐个覆盖
        records.sort_by_key(|r| r.instance_id);
        records
    }

    /// 本地选择一个实例，应用负载均衡策略
    pub fn pick(&self, service_name: &str, version_filter: Option<&str>) -> Option<InstanceRecord> {
        let candidates = self.discover(service_name, version_filter, true);
        let canonical = self
            .canonical_name(service_name)
            .unwrap_or_else(|| service_name.to_string());
        self.balancer.select(&canonical, &candidates)
    }

    /// 订阅某服务健康实例集合的变化
    pub fn subscribe(&self, service_name: &str, callback: ServiceSubscriber) {
        self.subscribers
            .entry(service_name.to_string())
            .or_default()
            .push(callback);
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().unwrap().clone()
    }

    /// 服务名解析：先精确再按小写索引
    pub fn canonical_name(&self, service_name: &str) -> Option<String> {
        if self.by_service.contains_key(service_name) {
            return Some(service_name.to_string());
        }
        self.name_index
            .get(&service_name.to_lowercase())
            .map(|entry| entry.value().clone())
    }

    /// 推送事件入队。队列满时丢弃，由拉取端对账。
    pub(super) fn enqueue_push_event(&self, event: ServiceChangeEvent) {
        let mut stats = self.stats.lock().unwrap();
        match self.queue_tx.try_send(event) {
            Ok(()) => stats.push_events += 1,
            Err(_) => {
                stats.push_dropped += 1;
            }
        }
    }

    fn spawn_pull_loop(self: &Arc<Self>) {
        let cache = self.clone();
        let shutdown = self.shutdown.clone();
        let sync_interval = self.config.sync_interval();

        self.task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(sync_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = cache.sync_once().await {
                            cache.stats.lock().unwrap().pull_failures += 1;
                            tracing::warn!(error = %e, "Incremental registry pull failed");
                        }
                    }
                }
            }
            tracing::debug!("Discovery pull loop stopped");
        });
    }

    fn spawn_batch_applier(self: &Arc<Self>) {
        let cache = self.clone();
        let shutdown = self.shutdown.clone();
        let batch_interval = self.config.batch_interval();
        let threshold = self.config.batch_threshold;

        let mut queue_rx = match self.queue_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return, // start 只允许调用一次
        };

        self.task_tracker.spawn(async move {
            let mut buffer: Vec<ServiceChangeEvent> = Vec::new();
            let mut interval = tokio::time::interval(batch_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if !buffer.is_empty() {
                            cache.apply_batch(std::mem::take(&mut buffer));
                        }
                    }
                    event = queue_rx.recv() => {
                        match event {
                            Some(event) => {
                                buffer.push(event);
                                if buffer.len() >= threshold {
                                    cache.apply_batch(std::mem::take(&mut buffer));
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            tracing::debug!("Discovery batch applier stopped");
        });
    }

    /// 单次增量拉取并应用
    pub async fn sync_once(&self) -> Result<(), CacheError> {
        let url = self.config.changes_url(self.local_version());
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(CacheError::PullStatus(response.status()));
        }
        let changes: ChangesResponse = response.json().await?;

        self.stats.lock().unwrap().pulls += 1;
        self.apply_changes(&changes);
        Ok(())
    }

    /// 应用一次拉取应答。全量快照先清空本地状态再重建。
    pub fn apply_changes(&self, changes: &ChangesResponse) {
        let mut touched: HashSet<String> = HashSet::new();

        if changes.full_snapshot {
            tracing::info!(
                registry_version = changes.version,
                "Applying full registry snapshot, resetting cache"
            );
            for entry in self.by_service.iter() {
                touched.insert(entry.key().clone());
            }
            self.instances.clear();
            self.by_service.clear();
            self.name_index.clear();
            self.applied_versions.clear();
            self.stats.lock().unwrap().full_resets += 1;
        }

        for record in &changes.added_or_updated {
            if let Some(service) = self.apply_upsert(record.clone(), changes.version) {
                touched.insert(service);
            }
        }
        for instance_id in &changes.removed {
            if let Some(service) = self.apply_remove(instance_id, changes.version) {
                touched.insert(service);
            }
        }

        // 游标单调前进
        self.version.fetch_max(changes.version, Ordering::AcqRel);
        self.notify_if_changed(touched);
    }

    // 合并批量：每个实例只保留最高版本的事件
    fn apply_batch(&self, events: Vec<ServiceChangeEvent>) {
        let mut latest: HashMap<Uuid, ServiceChangeEvent> = HashMap::new();
        for event in events {
            match latest.get(&event.instance_id) {
                Some(existing) if existing.version >= event.version => {}
                _ => {
                    latest.insert(event.instance_id, event);
                }
            }
        }

        let mut touched = HashSet::new();
        for (_, event) in latest {
            let service = match event.kind {
                ChangeKind::Upsert => match event.record {
                    Some(record) => self.apply_upsert(record, event.version),
                    None => None,
                },
                ChangeKind::Remove => self.apply_remove(&event.instance_id, event.version),
            };
            if let Some(service) = service {
                touched.insert(service);
            }
        }

        self.stats.lock().unwrap().batches_applied += 1;
        self.notify_if_changed(touched);
    }

    // 版本不高于已应用版本的事件是旧消息，直接丢弃
    fn apply_upsert(&self, record: InstanceRecord, version: u64) -> Option<String> {
        if let Some(applied) = self.applied_versions.get(&record.instance_id) {
            if *applied >= version {
                return None;
            }
        }

        let service = record.service_name.clone();
        self.applied_versions.insert(record.instance_id, version);
        self.by_service
            .entry(service.clone())
            .or_default()
            .insert(record.instance_id);
        self.name_index
            .insert(service.to_lowercase(), service.clone());
        self.instances.insert(record.instance_id, record);
        Some(service)
    }

    fn apply_remove(&self, instance_id: &Uuid, version: u64) -> Option<String> {
        if let Some(applied) = self.applied_versions.get(instance_id) {
            if *applied >= version {
                return None;
            }
        }
        self.applied_versions.insert(*instance_id, version);

        let (_, record) = self.instances.remove(instance_id)?;
        let service = record.service_name.clone();

        let now_empty = match self.by_service.get_mut(&service) {
            Some(mut ids) => {
                ids.remove(instance_id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_service.remove_if(&service, |_, ids| ids.is_empty());
            self.name_index.remove(&service.to_lowercase());
        }

        self.balancer.forget_instance(instance_id);
        Some(service)
    }

    // 被触达服务的健康集合发生变化时回调订阅者
    fn notify_if_changed(&self, touched: HashSet<String>) {
        for service in touched {
            let healthy = self.discover(&service, None, true);
            let view: BTreeSet<Uuid> = healthy.iter().map(|r| r.instance_id).collect();

            let changed = match self.healthy_view.get(&service) {
                Some(previous) => *previous != view,
                None => !view.is_empty(),
            };
            if !changed {
                continue;
            }
            self.healthy_view.insert(service.clone(), view);

            if let Some(subscribers) = self.subscribers.get(&service) {
                self.stats.lock().unwrap().notifications += 1;
                for callback in subscribers.iter() {
                    callback(&service, &healthy);
                }
            }
        }
    }

    /// 等待维护任务退出
    pub async fn wait_shutdown(&self) {
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }
}
