use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use chrono::Utc;
use uuid::Uuid;

use meshway::config::RegistryConfig;
use meshway::models::{InstanceRecord, InstanceStatus};
use meshway::services::feed::ChangeFeed;
use meshway::services::reaper::HealthReaper;
use meshway::services::store::{InstanceStore, StoreBackend};

fn record(service: &str, host: &str, port: u16) -> InstanceRecord {
    let now = Utc::now();
    InstanceRecord {
        instance_id: Uuid::new_v4(),
        service_name: service.to_string(),
        host: host.to_string(),
        port,
        version_tag: String::new(),
        metadata: HashMap::new(),
        health_check_url: None,
        weight: 100,
        registered_at: now,
        last_heartbeat: now,
        status: InstanceStatus::Healthy,
    }
}

async fn spawn_backend(app: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn overdue_heartbeat_demotes_then_evicts() {
    let store = InstanceStore::new(Arc::new(ChangeFeed::new(64)));
    let a = record("Orders", "10.0.0.1", 5001);
    store.upsert(a.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    // 心跳超时（置 0 模拟超过 T_miss），驱逐阈值未到：只降级
    let demote_only = RegistryConfig {
        miss_timeout: 0,
        evict_timeout: 3600,
        ..RegistryConfig::default()
    };
    HealthReaper::sweep_once(&store, &demote_only);
    let after = store.get(&a.instance_id).unwrap();
    assert_eq!(after.status, InstanceStatus::Unhealthy);

    // healthyOnly 视图里不再出现
    let healthy: Vec<_> = store
        .list_by_service("Orders")
        .into_iter()
        .filter(|r| r.status == InstanceStatus::Healthy)
        .collect();
    assert!(healthy.is_empty());

    // 降级是幂等的：重复扫描不再递增版本
    let version = store.version();
    HealthReaper::sweep_once(&store, &demote_only);
    assert_eq!(store.version(), version);

    // 超过 T_evict 后整个移除
    let evict = RegistryConfig {
        miss_timeout: 0,
        evict_timeout: 0,
        ..RegistryConfig::default()
    };
    HealthReaper::sweep_once(&store, &evict);
    assert!(store.get(&a.instance_id).is_none());
}

#[tokio::test]
async fn fresh_heartbeat_survives_sweep() {
    let store = InstanceStore::new(Arc::new(ChangeFeed::new(64)));
    let a = record("Orders", "10.0.0.1", 5001);
    store.upsert(a.clone()).unwrap();

    HealthReaper::sweep_once(&store, &RegistryConfig::default());
    let after = store.get(&a.instance_id).unwrap();
    assert_eq!(after.status, InstanceStatus::Healthy);
}

#[tokio::test]
async fn successful_probe_restores_health_and_heartbeat() {
    let backend = spawn_backend(Router::new().route("/health", get(|| async { "ok" }))).await;

    let store = InstanceStore::new(Arc::new(ChangeFeed::new(64)));
    let a = record("Orders", &backend.ip().to_string(), backend.port());
    store.upsert(a.clone()).unwrap();
    store.set_status(&a.instance_id, InstanceStatus::Unhealthy);

    let before = store.get(&a.instance_id).unwrap().last_heartbeat;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        HealthReaper::probe_all(&store, &http),
    )
    .await
    .expect("probe timed out");

    let after = store.get(&a.instance_id).unwrap();
    assert_eq!(after.status, InstanceStatus::Healthy);
    assert!(after.last_heartbeat >= before);
}

#[tokio::test]
async fn failing_probe_demotes_healthy_instance() {
    let backend = spawn_backend(Router::new().route(
        "/health",
        get(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "down") }),
    ))
    .await;

    let store = InstanceStore::new(Arc::new(ChangeFeed::new(64)));
    let a = record("Orders", &backend.ip().to_string(), backend.port());
    store.upsert(a.clone()).unwrap();

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        HealthReaper::probe_all(&store, &http),
    )
    .await
    .expect("probe timed out");

    // 探测失败只降级，不驱逐
    let after = store.get(&a.instance_id).unwrap();
    assert_eq!(after.status, InstanceStatus::Unhealthy);
}

#[tokio::test]
async fn unreachable_probe_target_demotes_instance() {
    let store = InstanceStore::new(Arc::new(ChangeFeed::new(64)));
    // 连接被拒绝的端口
    let a = record("Orders", "127.0.0.1", 1);
    store.upsert(a.clone()).unwrap();

    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        HealthReaper::probe_all(&store, &http),
    )
    .await
    .expect("probe timed out");

    assert_eq!(
        store.get(&a.instance_id).unwrap().status,
        InstanceStatus::Unhealthy
    );
}
