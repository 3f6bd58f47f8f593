use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::routing::{any, get};
use axum::Router;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use meshway::config::{BreakerConfig, DiscoveryConfig, ProxyConfig};
use meshway::models::{ChangesResponse, InstanceRecord, InstanceStatus};
use meshway::services::balancer::{BalancerPolicy, InFlightTracker, LoadBalancer};
use meshway::services::discovery::DiscoveryCache;
use meshway::services::proxy::{extract_route, is_proxy_path, ProxyService};

fn record_at(service: &str, addr: std::net::SocketAddr, weight: u32) -> InstanceRecord {
    let now = Utc::now();
    InstanceRecord {
        instance_id: Uuid::new_v4(),
        service_name: service.to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        version_tag: String::new(),
        metadata: HashMap::new(),
        health_check_url: None,
        weight,
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

/// 不启动任何维护循环的本地缓存，直接灌入变更
fn local_cache() -> Arc<DiscoveryCache> {
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

fn proxy_with(cache: Arc<DiscoveryCache>, config: ProxyConfig) -> ProxyService {
    ProxyService::new(config, cache, Arc::new(InFlightTracker::new()))
}

fn seed(cache: &DiscoveryCache, version: u64, records: Vec<InstanceRecord>) {
    cache.apply_changes(&ChangesResponse {
        version,
        added_or_updated: records,
        removed: Vec::new(),
        full_snapshot: false,
    });
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn route_extraction_prefix_service_and_rest() {
    let prefixes = vec!["svc".to_string(), "api".to_string(), "gateway".to_string()];

    let route = extract_route("/svc/Orders/info", &prefixes).unwrap();
    assert_eq!(route.service_name, "Orders");
    assert_eq!(route.forward_path, "/info");

    // 前缀大小写不敏感
    let route = extract_route("/SVC/Orders/a/b/c", &prefixes).unwrap();
    assert_eq!(route.forward_path, "/a/b/c");

    // 服务名后没有子路径时转发根路径
    let route = extract_route("/gateway/Orders", &prefixes).unwrap();
    assert_eq!(route.forward_path, "/");

    assert!(extract_route("/other/Orders/info", &prefixes).is_err());
    assert!(extract_route("/svc", &prefixes).is_err());
    assert!(is_proxy_path("/api/Orders/x", &prefixes));
    assert!(!is_proxy_path("/metrics", &prefixes));
}

#[tokio::test]
async fn happy_path_forwards_to_backend() {
    let backend = spawn_backend(Router::new().route(
        "/info",
        get(|| async { axum::Json(serde_json::json!({"ok": true})) }),
    ))
    .await;

    let cache = local_cache();
    seed(&cache, 1, vec![record_at("Orders", backend, 100)]);
    let proxy = proxy_with(cache, ProxyConfig::default());

    let request = Request::builder()
        .uri("/svc/Orders/info")
        .body(Body::empty())
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), proxy.handle(request))
        .await
        .expect("proxy timed out");

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(proxy.stats().forwarded, 1);
}

#[tokio::test]
async fn query_string_and_body_pass_through() {
    async fn echo(req: Request<Body>) -> axum::response::Response {
        let query = req.uri().query().unwrap_or("").to_string();
        let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .unwrap();
        axum::response::Response::builder()
            .header("x-echo-query", query)
            .body(Body::from(bytes))
            .unwrap()
    }

    let backend = spawn_backend(Router::new().route("/echo", any(echo))).await;
    let cache = local_cache();
    seed(&cache, 1, vec![record_at("Orders", backend, 100)]);
    let proxy = proxy_with(cache, ProxyConfig::default());

    let request = Request::builder()
        .method("POST")
        .uri("/api/orders/echo?limit=5")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("payload bytes"))
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), proxy.handle(request))
        .await
        .expect("proxy timed out");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-echo-query").unwrap(),
        "limit=5"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"payload bytes");
}

#[tokio::test]
async fn trace_headers_are_attached_to_upstream_requests() {
    async fn capture(State(seen): State<Arc<std::sync::Mutex<Option<String>>>>, req: Request<Body>) -> &'static str {
        let traceparent = req
            .headers()
            .get("traceparent")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        *seen.lock().unwrap() = traceparent;
        "ok"
    }

    let seen: Arc<std::sync::Mutex<Option<String>>> = Arc::new(std::sync::Mutex::new(None));
    let backend = spawn_backend(
        Router::new()
            .route("/info", any(capture))
            .with_state(seen.clone()),
    )
    .await;

    let cache = local_cache();
    seed(&cache, 1, vec![record_at("Orders", backend, 100)]);
    let proxy = proxy_with(cache, ProxyConfig::default());

    let incoming = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
    let request = Request::builder()
        .uri("/svc/Orders/info")
        .header("traceparent", incoming)
        .body(Body::empty())
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), proxy.handle(request))
        .await
        .expect("proxy timed out");
    assert_eq!(response.status(), StatusCode::OK);

    // 上游看到的是派生的子 span：同 traceId，新 spanId
    let forwarded = seen.lock().unwrap().clone().expect("no traceparent seen");
    assert!(forwarded.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));
    assert_ne!(forwarded, incoming);
}

#[tokio::test]
async fn empty_healthy_set_returns_503_without_backend_contact() {
    let contacted = Arc::new(AtomicBool::new(false));
    let flag = contacted.clone();
    let backend = spawn_backend(Router::new().fallback(move || {
        let flag = flag.clone();
        async move {
            flag.store(true, Ordering::SeqCst);
            "reached"
        }
    }))
    .await;

    let cache = local_cache();
    // 实例存在但不健康
    let mut sick = record_at("Orders", backend, 100);
    sick.status = InstanceStatus::Unhealthy;
    seed(&cache, 1, vec![sick]);

    let proxy = proxy_with(cache, ProxyConfig::default());
    let request = Request::builder()
        .uri("/svc/Orders/info")
        .body(Body::empty())
        .unwrap();
    let response = proxy.handle(request).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"], "ServiceUnavailable");
    assert_eq!(body["service"], "Orders");
    assert!(!contacted.load(Ordering::SeqCst));
    assert_eq!(proxy.stats().no_instance, 1);
}

#[tokio::test]
async fn breaker_trips_per_destination_and_recovers() {
    // A 按开关决定 500/200，B 恒 200
    let a_failing = Arc::new(AtomicBool::new(true));
    let a_hits = Arc::new(AtomicUsize::new(0));
    let a_state = (a_failing.clone(), a_hits.clone());
    let backend_a = spawn_backend(Router::new().fallback(move || {
        let (failing, hits) = a_state.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            if failing.load(Ordering::SeqCst) {
                (StatusCode::INTERNAL_SERVER_ERROR, "boom")
            } else {
                (StatusCode::OK, "recovered")
            }
        }
    }))
    .await;
    let backend_b = spawn_backend(Router::new().fallback(|| async { "ok" })).await;

    let cache = local_cache();
    let instance_a = record_at("Orders", backend_a, 100);
    let instance_b = record_at("Orders", backend_b, 100);
    seed(&cache, 1, vec![instance_a.clone(), instance_b.clone()]);

    // 打开时长压到 1 秒方便恢复验证
    let config = ProxyConfig {
        breaker: BreakerConfig {
            failure_threshold: 5,
            open_duration: 1,
            max_open_duration: 4,
        },
        ..ProxyConfig::default()
    };
    let proxy = proxy_with(cache, config);

    let send = |proxy: ProxyService| async move {
        let request = Request::builder()
            .uri("/svc/Orders/ping")
            .body(Body::empty())
            .unwrap();
        proxy.handle(request).await
    };

    // 轮询打满两个实例，A 吃到 5 次连续失败后熔断
    let mut a_failures = 0;
    let mut b_successes = 0;
    for _ in 0..20 {
        let response = tokio::time::timeout(Duration::from_secs(5), send(proxy.clone()))
            .await
            .expect("proxy timed out");
        match response.status() {
            StatusCode::INTERNAL_SERVER_ERROR => a_failures += 1,
            StatusCode::OK => b_successes += 1,
            StatusCode::SERVICE_UNAVAILABLE => {
                let body = body_json(response).await;
                assert_eq!(body["error"], "CircuitOpen");
            }
            other => panic!("unexpected status {}", other),
        }
        if a_failures >= 5 {
            break;
        }
    }
    assert_eq!(a_failures, 5);
    assert!(b_successes >= 4);
    // 两个目标各有自己的熔断器
    assert_eq!(proxy.breakers().len(), 2);

    // A 熔断打开：打到 A 的请求拿到 503 且不再触达后端；B 照常服务
    let a_hits_when_open = a_hits.load(Ordering::SeqCst);
    let mut circuit_open_seen = 0;
    for _ in 0..10 {
        let response = tokio::time::timeout(Duration::from_secs(5), send(proxy.clone()))
            .await
            .expect("proxy timed out");
        match response.status() {
            StatusCode::SERVICE_UNAVAILABLE => {
                let body = body_json(response).await;
                assert_eq!(body["error"], "CircuitOpen");
                circuit_open_seen += 1;
            }
            StatusCode::OK => {}
            other => panic!("unexpected status {}", other),
        }
    }
    assert!(circuit_open_seen > 0);
    assert_eq!(a_hits.load(Ordering::SeqCst), a_hits_when_open);

    // 打开期过后 A 恢复：半开探测成功，熔断关闭
    a_failing.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let mut a_recovered = false;
    for _ in 0..10 {
        let response = tokio::time::timeout(Duration::from_secs(5), send(proxy.clone()))
            .await
            .expect("proxy timed out");
        if response.status() == StatusCode::OK {
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            if &bytes[..] == b"recovered" {
                a_recovered = true;
                break;
            }
        }
    }
    assert!(a_recovered, "instance A should serve again after recovery");
}

#[tokio::test]
async fn upstream_connection_refused_maps_to_502() {
    let cache = local_cache();
    // 无监听端口：连接被拒绝
    let dead = "127.0.0.1:1".parse().unwrap();
    seed(&cache, 1, vec![record_at("Orders", dead, 100)]);
    let proxy = proxy_with(cache, ProxyConfig::default());

    let request = Request::builder()
        .uri("/svc/Orders/info")
        .body(Body::empty())
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(10), proxy.handle(request))
        .await
        .expect("proxy timed out");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"], "TransientNetwork");
    assert_eq!(proxy.stats().upstream_failures, 1);
}

#[tokio::test]
async fn non_proxy_path_is_rejected_with_404() {
    let cache = local_cache();
    let proxy = proxy_with(cache, ProxyConfig::default());

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = proxy.handle(request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Validation");
}
