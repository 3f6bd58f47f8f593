use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;

use crate::config::ProxyConfig;
use crate::services::balancer::InFlightTracker;
use crate::services::discovery::DiscoveryCache;
use crate::trace::{LogTraceSink, TraceContext, TraceSink};

use super::breaker::{Admission, BreakerRegistry};
use super::error::ProxyError;
use super::extractor::extract_route;
use super::forwarder::{filter_request_headers, forward};
use super::pools::UpstreamPools;
use super::response::error_response;

/// 代理统计信息
#[derive(Debug, Clone, Default)]
pub struct ProxyStats {
    pub forwarded: u64,
    pub no_instance: u64,
    pub breaker_rejections: u64,
    pub upstream_failures: u64,
}

struct ProxyInner {
    config: ProxyConfig,
    cache: Arc<DiscoveryCache>,
    breakers: BreakerRegistry,
    pools: UpstreamPools,
    in_flight: Arc<InFlightTracker>,
    sink: Arc<dyn TraceSink>,
    stats: Mutex<ProxyStats>,
}

/// 动态反向代理。每个请求：解析路径里的服务名，
/// 向发现缓存要一个健康实例，在熔断器与限期约束下流式转发。
#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<ProxyInner>,
}

impl ProxyService {
    pub fn new(
        config: ProxyConfig,
        cache: Arc<DiscoveryCache>,
        in_flight: Arc<InFlightTracker>,
    ) -> Self {
        let breakers = BreakerRegistry::new(config.breaker.clone());
        let pools = UpstreamPools::new(&config);
        Self {
            inner: Arc::new(ProxyInner {
                config,
                cache,
                breakers,
                pools,
                in_flight,
                sink: Arc::new(LogTraceSink),
                stats: Mutex::new(ProxyStats::default()),
            }),
        }
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.sink = sink,
            None => tracing::warn!("Trace sink can only be replaced before the proxy is shared"),
        }
        self
    }

    pub fn stats(&self) -> ProxyStats {
        self.inner.stats.lock().unwrap().clone()
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.inner.breakers
    }

    /// 请求入口
    pub async fn handle(&self, req: Request) -> Response {
        let inner = &self.inner;
        let path = req.uri().path().to_string();

        let route = match extract_route(&path, &inner.config.route_prefixes) {
            Ok(route) => route,
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "Request outside proxy namespace");
                return error_response(&e, "");
            }
        };
        let service_name = route.service_name.clone();

        // 提取或新建追踪上下文并派生子 span
        let context = TraceContext::from_headers(req.headers());
        let started = Instant::now();

        let outcome = crate::trace::with_context(
            context.clone(),
            self.dispatch(req, &route.service_name, &route.forward_path, &context),
        )
        .await;

        inner.sink.record_span(
            &context,
            &format!("proxy {}", service_name),
            started.elapsed(),
            outcome.is_ok(),
        );

        match outcome {
            Ok(response) => response,
            Err(e) => error_response(&e, &service_name),
        }
    }

    async fn dispatch(
        &self,
        req: Request,
        service_name: &str,
        forward_path: &str,
        context: &TraceContext,
    ) -> Result<Response, ProxyError> {
        let inner = &self.inner;

        // 本地解析，不触网；没有健康实例直接 503，不碰任何后端
        let instance = match inner.cache.pick(service_name, None) {
            Some(instance) => instance,
            None => {
                inner.stats.lock().unwrap().no_instance += 1;
                return Err(ProxyError::ServiceUnavailable(service_name.to_string()));
            }
        };

        // 熔断按目标实例隔离：一个实例打开不影响同服务的其他实例
        let breaker = inner.breakers.get(instance.instance_id);
        let admission = breaker.admit();
        if admission == Admission::Rejected {
            inner.stats.lock().unwrap().breaker_rejections += 1;
            return Err(ProxyError::CircuitOpen(service_name.to_string()));
        }

        let query = req
            .uri()
            .query()
            .map(|q| format!("?{}", q))
            .unwrap_or_default();
        let url = format!("{}{}{}", instance.base_url(), forward_path, query);

        let (client, deadline) = inner.pools.select(req.headers(), &inner.config);
        let method = req.method().clone();
        let mut headers = filter_request_headers(req.headers());
        context.inject(&mut headers);

        tracing::debug!(
            service_name = %service_name,
            instance_id = %instance.instance_id,
            upstream_url = %url,
            deadline_secs = deadline.as_secs(),
            probe = %(admission == Admission::Probe),
            "Forwarding request to upstream instance"
        );

        let _guard = inner.in_flight.begin(instance.instance_id);
        let result = forward(client, method, url, headers, req.into_body(), deadline).await;

        match result {
            Ok(response) => {
                // 非 2xx 一律计入失败，但应答仍原样返回给调用方
                if response.status().is_success() {
                    breaker.on_success();
                } else {
                    breaker.on_failure();
                }
                inner.stats.lock().unwrap().forwarded += 1;
                Ok(response)
            }
            Err(e) => {
                if e.counts_as_breaker_failure() {
                    breaker.on_failure();
                }
                inner.stats.lock().unwrap().upstream_failures += 1;
                tracing::warn!(
                    service_name = %service_name,
                    instance_id = %instance.instance_id,
                    error = %e,
                    "Upstream call failed"
                );
                Err(e)
            }
        }
    }
}

/// axum 回退处理器：所有落在代理前缀下的请求都从这里进入
pub async fn proxy_fallback(State(proxy): State<ProxyService>, req: Request<Body>) -> Response {
    proxy.handle(req).await
}
