use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use meshway::config::DiscoveryConfig;
use meshway::models::{ChangesResponse, InstanceRecord, InstanceStatus};
use meshway::services::balancer::{BalancerPolicy, InFlightTracker, LoadBalancer};
use meshway::services::discovery::DiscoveryCache;

fn record(service: &str, host: &str, weight: u32) -> InstanceRecord {
    let now = Utc::now();
    InstanceRecord {
        instance_id: Uuid::new_v4(),
        service_name: service.to_string(),
        host: host.to_string(),
        port: 5001,
        version_tag: "1.0.0".to_string(),
        metadata: HashMap::new(),
        health_check_url: None,
        weight,
        registered_at: now,
        last_heartbeat: now,
        status: InstanceStatus::Healthy,
    }
}

fn cache() -> Arc<DiscoveryCache> {
    let balancer = LoadBalancer::new(
        BalancerPolicy::RoundRobin,
        Arc::new(InFlightTracker::new()),
    );
    DiscoveryCache::new(
        DiscoveryConfig::default(),
        balancer,
        CancellationToken::new(),
    )
}

fn upserts(version: u64, records: Vec<InstanceRecord>) -> ChangesResponse {
    ChangesResponse {
        version,
        added_or_updated: records,
        removed: Vec::new(),
        full_snapshot: false,
    }
}

#[tokio::test]
async fn incremental_changes_converge_to_registry_state() {
    let cache = cache();
    let a = record("Orders", "10.0.0.1", 100);
    let b = record("Orders", "10.0.0.2", 100);

    cache.apply_changes(&upserts(10, vec![a.clone(), b.clone()]));
    assert_eq!(cache.local_version(), 10);
    assert_eq!(cache.discover("Orders", None, false).len(), 2);

    // 注册 C (v11)、注销 A (v12)、B 改权重 (v13) —— 合并成一次应答
    let c = record("Orders", "10.0.0.3", 100);
    let mut b2 = b.clone();
    b2.weight = 10;
    cache.apply_changes(&ChangesResponse {
        version: 13,
        added_or_updated: vec![c.clone(), b2.clone()],
        removed: vec![a.instance_id],
        full_snapshot: false,
    });

    assert_eq!(cache.local_version(), 13);
    let orders = cache.discover("Orders", None, false);
    let ids: Vec<Uuid> = orders.iter().map(|r| r.instance_id).collect();
    assert!(ids.contains(&b.instance_id));
    assert!(ids.contains(&c.instance_id));
    assert!(!ids.contains(&a.instance_id));
    let b_now = orders
        .iter()
        .find(|r| r.instance_id == b.instance_id)
        .unwrap();
    assert_eq!(b_now.weight, 10);
}

#[tokio::test]
async fn redelivered_changes_are_idempotent() {
    let cache = cache();
    let a = record("Orders", "10.0.0.1", 100);

    let changes = upserts(5, vec![a.clone()]);
    cache.apply_changes(&changes);
    cache.apply_changes(&changes);

    assert_eq!(cache.discover("Orders", None, false).len(), 1);
    assert_eq!(cache.local_version(), 5);

    // 旧版本的移除不回退新状态
    cache.apply_changes(&ChangesResponse {
        version: 3,
        added_or_updated: Vec::new(),
        removed: vec![a.instance_id],
        full_snapshot: false,
    });
    assert_eq!(cache.discover("Orders", None, false).len(), 1);
    assert_eq!(cache.local_version(), 5);
}

#[tokio::test]
async fn full_snapshot_resets_local_state() {
    let cache = cache();
    let stale = record("Orders", "10.0.0.1", 100);
    cache.apply_changes(&upserts(5, vec![stale.clone()]));

    // 全量快照：本地状态清空重建，旧实例消失
    let fresh = record("Payments", "10.0.0.9", 100);
    cache.apply_changes(&ChangesResponse {
        version: 40,
        added_or_updated: vec![fresh.clone()],
        removed: Vec::new(),
        full_snapshot: true,
    });

    assert!(cache.discover("Orders", None, false).is_empty());
    assert_eq!(cache.discover("Payments", None, false).len(), 1);
    assert_eq!(cache.local_version(), 40);
    assert_eq!(cache.stats().full_resets, 1);
}

#[tokio::test]
async fn lookups_filter_by_version_and_health() {
    let cache = cache();
    let mut old = record("Orders", "10.0.0.1", 100);
    old.version_tag = "0.9.0".to_string();
    let mut sick = record("Orders", "10.0.0.2", 100);
    sick.status = InstanceStatus::Unhealthy;
    let good = record("Orders", "10.0.0.3", 100);

    cache.apply_changes(&upserts(3, vec![old.clone(), sick.clone(), good.clone()]));

    assert_eq!(cache.discover("Orders", None, false).len(), 3);
    assert_eq!(cache.discover("Orders", Some("1.0.0"), false).len(), 2);
    let healthy = cache.discover("Orders", None, true);
    assert_eq!(healthy.len(), 2);
    assert!(healthy.iter().all(|r| r.status == InstanceStatus::Healthy));
}

#[tokio::test]
async fn service_names_match_case_insensitively() {
    let cache = cache();
    let a = record("Orders", "10.0.0.1", 100);
    cache.apply_changes(&upserts(1, vec![a.clone()]));

    // 代理路径里的服务名大小写不敏感
    assert_eq!(cache.discover("orders", None, false).len(), 1);
    assert_eq!(cache.discover("ORDERS", None, false).len(), 1);
    assert!(cache.pick("oRdErS", None).is_some());
    assert_eq!(cache.canonical_name("orders").as_deref(), Some("Orders"));
}

#[tokio::test]
async fn zero_weight_instances_are_never_picked() {
    let cache = cache();
    let dormant = record("Orders", "10.0.0.1", 0);
    let active = record("Orders", "10.0.0.2", 100);
    cache.apply_changes(&upserts(2, vec![dormant.clone(), active.clone()]));

    for _ in 0..20 {
        let picked = cache.pick("Orders", None).unwrap();
        assert_eq!(picked.instance_id, active.instance_id);
    }
}

#[tokio::test]
async fn subscribers_fire_only_on_healthy_set_change() {
    let cache = cache();
    let notifications = Arc::new(AtomicUsize::new(0));

    let counter = notifications.clone();
    cache.subscribe(
        "Orders",
        Arc::new(move |_service, _healthy| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let a = record("Orders", "10.0.0.1", 100);
    cache.apply_changes(&upserts(1, vec![a.clone()]));
    assert_eq!(notifications.load(Ordering::SeqCst), 1);

    // 健康集合没变（同一实例重复投递）不触发回调
    cache.apply_changes(&upserts(2, vec![a.clone()]));
    assert_eq!(notifications.load(Ordering::SeqCst), 1);

    // 实例降级，健康集合缩为空，触发回调
    let mut sick = a.clone();
    sick.status = InstanceStatus::Unhealthy;
    cache.apply_changes(&upserts(3, vec![sick]));
    assert_eq!(notifications.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn pull_loop_converges_against_live_registry() {
    use meshway::services::registry::{build_registry, registry_router, RegistryState};

    let (registry, _store) = build_registry(64);
    let state = RegistryState {
        registry: registry.clone(),
        config: meshway::config::RegistryConfig::default(),
        shutdown: CancellationToken::new(),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, registry_router(state)).await.unwrap();
    });

    let config = DiscoveryConfig {
        registry_url: format!("http://{}", addr),
        sync_interval: 1,
        enable_push: false, // 推送断供下仅靠拉取收敛
        ..DiscoveryConfig::default()
    };
    let balancer = LoadBalancer::new(
        BalancerPolicy::RoundRobin,
        Arc::new(InFlightTracker::new()),
    );
    let shutdown = CancellationToken::new();
    let cache = DiscoveryCache::new(config, balancer, shutdown.clone());
    cache.start();

    registry
        .register(meshway::models::RegisterRequest {
            service_name: "Orders".to_string(),
            host: "10.0.0.1".to_string(),
            port: 5001,
            version: "1.0.0".to_string(),
            metadata: HashMap::new(),
            health_check_url: None,
            weight: 100,
            instance_id: None,
        })
        .unwrap();

    // 在 2 个同步周期内收敛
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    loop {
        if !cache.discover("Orders", None, true).is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cache failed to converge within two sync intervals"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(cache.local_version() > 0);
    shutdown.cancel();
    cache.wait_shutdown().await;
}
