use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RegistryConfig;
use crate::models::InstanceStatus;
use crate::services::store::{InstanceStore, StoreBackend};

/// 健康收割器：驱动两条时间线。
/// 心跳超时把实例降级为 Unhealthy，驱逐超时把实例整个移除；
/// 另有主动探测循环对健康检查端点发起 HTTP 探测。
pub struct HealthReaper {
    store: Arc<InstanceStore>,
    config: RegistryConfig,
    http: reqwest::Client,
    task_tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl HealthReaper {
    pub fn new(store: Arc<InstanceStore>, config: RegistryConfig, shutdown: CancellationToken) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .unwrap_or_default();

        Self {
            store,
            config,
            http,
            task_tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// 启动扫描与探测两个后台循环
    pub fn start(&self) {
        self.spawn_sweep_loop();
        self.spawn_probe_loop();
    }

    fn spawn_sweep_loop(&self) {
        let store = self.store.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();

        self.task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(config.sweep_interval());
            interval.tick().await; // 跳过第一个tick
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        Self::sweep_once(&store, &config);
                        store.feed().prune_tombstones(config.tombstone_retention());
                    }
                }
            }
            tracing::debug!("Reaper sweep loop stopped");
        });
    }

    fn spawn_probe_loop(&self) {
        let store = self.store.clone();
        let config = self.config.clone();
        let http = self.http.clone();
        let shutdown = self.shutdown.clone();

        self.task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(config.probe_interval());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        Self::probe_all(&store, &http).await;
                    }
                }
            }
            tracing::debug!("Reaper probe loop stopped");
        });
    }

    /// 单轮过期扫描：先收集再处理，避免在迭代中修改
    pub fn sweep_once(store: &InstanceStore, config: &RegistryConfig) {
        // 驱逐超时的直接移除
        let expired = store.list_expired(config.evict_timeout());
        for record in expired {
            let (removed, _version) = store.remove(&record.instance_id);
            if removed {
                tracing::warn!(
                    service_name = %record.service_name,
                    instance_id = %record.instance_id,
                    "Instance evicted after missing heartbeats"
                );
            }
        }

        // 心跳超时的降级为 Unhealthy
        let stale = store.list_expired(config.miss_timeout());
        for record in stale {
            if record.status == InstanceStatus::Healthy {
                if store.set_status(&record.instance_id, InstanceStatus::Unhealthy) {
                    tracing::warn!(
                        service_name = %record.service_name,
                        instance_id = %record.instance_id,
                        "Instance marked unhealthy, heartbeat overdue"
                    );
                }
            }
        }
    }

    /// 单轮主动探测。2xx 恢复 Healthy 并刷新心跳，
    /// 其余结果只把 Healthy 降级，不做驱逐。
    pub async fn probe_all(store: &InstanceStore, http: &reqwest::Client) {
        let instances = store.list_all();
        for record in instances {
            let url = record.probe_url();
            let outcome = http.get(&url).send().await;

            // 探测期间实例可能已被注销，touch/set_status 返回 false 即放弃
            match outcome {
                Ok(response) if response.status().is_success() => {
                    if store.touch(&record.instance_id) {
                        tracing::debug!(
                            service_name = %record.service_name,
                            instance_id = %record.instance_id,
                            "Health probe succeeded"
                        );
                    }
                }
                Ok(response) => {
                    Self::demote_if_healthy(store, &record.instance_id);
                    tracing::warn!(
                        service_name = %record.service_name,
                        instance_id = %record.instance_id,
                        status = %response.status(),
                        probe_url = %url,
                        "Health probe returned non-success status"
                    );
                }
                Err(e) => {
                    Self::demote_if_healthy(store, &record.instance_id);
                    tracing::warn!(
                        service_name = %record.service_name,
                        instance_id = %record.instance_id,
                        probe_url = %url,
                        error = %e,
                        "Health probe failed"
                    );
                }
            }
        }
    }

    fn demote_if_healthy(store: &InstanceStore, instance_id: &uuid::Uuid) {
        if let Some(current) = store.get(instance_id) {
            if current.status == InstanceStatus::Healthy {
                store.set_status(instance_id, InstanceStatus::Unhealthy);
            }
        }
    }

    /// 关停并等待后台循环退出
    pub async fn shutdown(&self) {
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }
}
