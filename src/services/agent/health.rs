use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;

/// 具名健康检查项
pub type HealthCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// 宿主应用的默认健康检查端点（enableDefaultHealthCheck 打开时挂载）
#[derive(Clone, Default)]
pub struct HealthEndpoint {
    service_name: String,
    checks: Arc<DashMap<String, HealthCheck>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    service: String,
    timestamp: chrono::DateTime<Utc>,
    checks: BTreeMap<String, &'static str>,
}

impl HealthEndpoint {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            checks: Arc::new(DashMap::new()),
        }
    }

    /// 注册一个具名检查项，任意一项失败时整体报 Down
    pub fn add_check(&self, name: impl Into<String>, check: HealthCheck) {
        self.checks.insert(name.into(), check);
    }

    /// 生成可挂到宿主路由上的子路由
    pub fn router(&self, path: &str) -> Router {
        Router::new()
            .route(path, get(health_handler))
            .with_state(self.clone())
    }
}

async fn health_handler(State(endpoint): State<HealthEndpoint>) -> Json<HealthReport> {
    let mut checks = BTreeMap::new();
    let mut all_up = true;
    for entry in endpoint.checks.iter() {
        let up = (entry.value())();
        all_up &= up;
        checks.insert(entry.key().clone(), if up { "Up" } else { "Down" });
    }

    Json(HealthReport {
        status: if all_up { "Up" } else { "Down" },
        service: endpoint.service_name.clone(),
        timestamp: Utc::now(),
        checks,
    })
}
