use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::services::balancer::{InFlightTracker, LoadBalancer};
use crate::services::discovery::DiscoveryCache;
use crate::services::proxy::{proxy_fallback, ProxyService};
use crate::services::reaper::HealthReaper;
use crate::services::registry::{build_registry, registry_router, RegistryState};

pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();

    // 注册中心：变更源 + 存储 + API 门面
    let (registry, store) = build_registry(config.registry.channel_capacity);
    let reaper = HealthReaper::new(store.clone(), config.registry.clone(), shutdown.clone());
    reaper.start();

    // 进程内代理的发现缓存对着本进程的注册中心做增量同步
    let in_flight = Arc::new(InFlightTracker::new());
    let balancer = LoadBalancer::new(config.proxy.balancer, in_flight.clone());
    let cache = DiscoveryCache::new(config.discovery.clone(), balancer, shutdown.clone());
    cache.start();

    let proxy = ProxyService::new(config.proxy.clone(), cache.clone(), in_flight);

    let registry_state = RegistryState {
        registry,
        config: config.registry.clone(),
        shutdown: shutdown.clone(),
    };
    // 注册中心路由优先匹配，代理吃掉其余所有路径
    let app = Router::new()
        .fallback(proxy_fallback)
        .with_state(proxy.clone())
        .merge(registry_router(registry_state));

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    tracing::info!(
        bind_addr = %config.server.bind_addr,
        route_prefixes = ?config.proxy.route_prefixes,
        "Gateway server listening"
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, draining");
        signal_token.cancel();
    });

    let graceful = shutdown.clone();
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await
    };

    // 在途请求最多排空 drain_timeout，之后强制关闭
    let drain = config.proxy.drain_timeout();
    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(drain).await;
        } => {
            tracing::warn!(drain_secs = drain.as_secs(), "Drain deadline exceeded, forcing close");
        }
    }

    reaper.shutdown().await;
    cache.wait_shutdown().await;
    tracing::info!("Gateway server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {}
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
