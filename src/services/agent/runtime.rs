use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::models::{AckResponse, HeartbeatRequest, RegisterRequest, RegisterResponse};

use super::adaptive::{HeartbeatController, MetricsWindow};
use super::config::{AgentConfig, FailurePolicy};
use super::error::AgentError;
use super::health::HealthEndpoint;
use super::identity::{resolve_identity, ServiceIdentity, ServiceInfoProvider};

const SHUTDOWN_HEARTBEAT_DEADLINE: Duration = Duration::from_secs(2);

/// 跑在每个后端进程里的服务代理。
/// 启动时按失败策略自动注册，之后以自适应节奏发送心跳，
/// 优雅停机时先补一次心跳再注销。
pub struct ServiceAgent {
    config: AgentConfig,
    identity: ServiceIdentity,
    http: reqwest::Client,
    instance_id: Mutex<Option<Uuid>>,
    window: Arc<MetricsWindow>,
    controller: Arc<HeartbeatController>,
    interval_rx: tokio::sync::watch::Receiver<Duration>,
    health: Option<HealthEndpoint>,
    task_tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ServiceAgent {
    /// 两阶段启动：先解析身份，再以不可变配置构造并注册。
    pub async fn start(
        config: AgentConfig,
        provider: Option<&dyn ServiceInfoProvider>,
    ) -> Result<Arc<Self>, AgentError> {
        let identity = resolve_identity(&config, provider)?;
        tracing::info!(
            service_name = %identity.service_name,
            host = %identity.host,
            port = %identity.port,
            registry_url = %config.registry_url,
            "Service identity resolved"
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let (controller, interval_rx) =
            HeartbeatController::new(config.adaptive.clone(), config.heartbeat_interval());

        let health = config
            .enable_default_health_check
            .then(|| HealthEndpoint::new(identity.service_name.clone()));

        let agent = Arc::new(Self {
            config,
            identity,
            http,
            instance_id: Mutex::new(None),
            window: Arc::new(MetricsWindow::new()),
            controller: Arc::new(controller),
            interval_rx,
            health,
            task_tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        if agent.config.auto_register {
            match agent.register_with_retry().await {
                Ok(instance_id) => {
                    tracing::info!(instance_id = %instance_id, "Initial registration succeeded");
                    agent.spawn_heartbeat_loop();
                    agent.spawn_controller_loop();
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => match agent.config.failure_policy {
                    FailurePolicy::FailFast => {
                        tracing::error!(error = %e, "Registration failed, failing fast");
                        return Err(e);
                    }
                    FailurePolicy::ContinueWithoutRegistration => {
                        tracing::warn!(
                            error = %e,
                            "Registration failed, continuing without registration"
                        );
                    }
                    FailurePolicy::ContinueAndRetry => {
                        tracing::warn!(
                            error = %e,
                            "Registration failed, continuing with background retry"
                        );
                        agent.spawn_background_register();
                    }
                },
            }
        }

        Ok(agent)
    }

    /// 宿主应用的请求埋点入口
    pub fn record_request(&self, duration: Duration, success: bool) {
        self.window
            .record(duration, success, self.controller.config().window());
    }

    pub fn instance_id(&self) -> Option<Uuid> {
        *self.instance_id.lock().unwrap()
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn controller(&self) -> &HeartbeatController {
        &self.controller
    }

    /// 默认健康检查端点，enableDefaultHealthCheck 打开时可用
    pub fn health_endpoint(&self) -> Option<&HealthEndpoint> {
        self.health.as_ref()
    }

    /// 宿主应用可直接挂载的健康检查子路由
    pub fn health_router(&self) -> Option<axum::Router> {
        self.health
            .as_ref()
            .map(|endpoint| endpoint.router(&self.config.health_check_path))
    }

    /// 前台注册：失败则睡 retry_interval 再试，最多 retry_count 次（0 不设限）
    async fn register_with_retry(&self) -> Result<Uuid, AgentError> {
        let mut retries: u32 = 0;
        loop {
            match self.register_once().await {
                Ok(instance_id) => return Ok(instance_id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    retries += 1;
                    if self.config.register_retry_count != 0
                        && retries > self.config.register_retry_count
                    {
                        return Err(AgentError::RetriesExhausted(e.to_string()));
                    }
                    tracing::warn!(
                        error = %e,
                        attempt = retries,
                        retry_interval_secs = self.config.register_retry_interval,
                        "Registration attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return Err(AgentError::RetriesExhausted("shutdown".to_string()));
                        }
                        _ = tokio::time::sleep(self.config.register_retry_interval()) => {}
                    }
                }
            }
        }
    }

    /// 单次注册。重试时带上已分配的 ID，对注册中心表现为幂等 upsert。
    async fn register_once(&self) -> Result<Uuid, AgentError> {
        let request = RegisterRequest {
            service_name: self.identity.service_name.clone(),
            host: self.identity.host.clone(),
            port: self.identity.port,
            version: self.config.version.clone(),
            metadata: self.config.metadata.clone(),
            health_check_url: self.config.health_check_url.clone(),
            weight: self.config.weight,
            instance_id: self.instance_id(),
        };

        let response = self
            .http
            .post(self.config.register_url())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: RegisterResponse = response.json().await?;
            let instance_id = body
                .instance_id
                .ok_or_else(|| AgentError::Unexpected(status))?;
            *self.instance_id.lock().unwrap() = Some(instance_id);
            return Ok(instance_id);
        }

        if status == reqwest::StatusCode::BAD_REQUEST {
            let message = response
                .json::<AckResponse>()
                .await
                .map(|ack| ack.message)
                .unwrap_or_else(|_| "bad request".to_string());
            // 换绑冲突是配置错误，其余 400 是校验失败，都不重试
            if message.contains("cannot rebind") {
                return Err(AgentError::BindingChanged(message));
            }
            return Err(AgentError::Rejected(message));
        }
        Err(AgentError::Unexpected(status))
    }

    async fn heartbeat_once(&self) -> Result<(), AgentError> {
        let instance_id = self.instance_id().ok_or(AgentError::NotRegistered)?;
        let request = HeartbeatRequest {
            instance_id,
            service_name: self.identity.service_name.clone(),
        };

        let response = self
            .http
            .post(self.config.heartbeat_url())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AgentError::NotFound);
        }
        Err(AgentError::Unexpected(status))
    }

    async fn deregister_once(&self, instance_id: Uuid) -> Result<(), AgentError> {
        let response = self
            .http
            .post(self.config.deregister_url(&instance_id))
            .send()
            .await?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(AgentError::Unexpected(response.status()));
        }
        Ok(())
    }

    // 心跳循环：watch 通道变化时立刻以新间隔重排
    fn spawn_heartbeat_loop(self: &Arc<Self>) {
        let agent = self.clone();
        let mut interval_rx = self.interval_rx.clone();
        let shutdown = self.shutdown.clone();

        self.task_tracker.spawn(async move {
            loop {
                let interval = *interval_rx.borrow();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // 间隔变化，立即按新节奏重排
                        continue;
                    }
                    _ = tokio::time::sleep(interval) => {
                        agent.beat().await;
                    }
                }
            }
            tracing::debug!("Heartbeat loop stopped");
        });
    }

    async fn beat(&self) {
        match self.heartbeat_once().await {
            Ok(()) => {
                self.controller.record_heartbeat_result(true);
                tracing::debug!(
                    service_name = %self.identity.service_name,
                    "Heartbeat delivered"
                );
            }
            // 注册中心不认识我们，注销过期或被驱逐，重新注册而不是重试心跳
            Err(AgentError::NotFound) => {
                tracing::warn!(
                    service_name = %self.identity.service_name,
                    "Heartbeat rejected as unknown instance, re-registering"
                );
                *self.instance_id.lock().unwrap() = None;
                match self.register_once().await {
                    Ok(instance_id) => {
                        self.controller.record_heartbeat_result(true);
                        tracing::info!(instance_id = %instance_id, "Re-registration succeeded");
                    }
                    Err(e) => {
                        self.controller.record_heartbeat_result(false);
                        tracing::warn!(error = %e, "Re-registration failed");
                    }
                }
            }
            Err(e) => {
                self.controller.record_heartbeat_result(false);
                tracing::warn!(error = %e, "Heartbeat failed");
            }
        }
    }

    // 控制器循环：每 tick 依据窗口指标重新分级
    fn spawn_controller_loop(self: &Arc<Self>) {
        let agent = self.clone();
        let shutdown = self.shutdown.clone();
        let tick = self.controller.config().tick();

        self.task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        agent.controller.tick(&agent.window);
                    }
                }
            }
            tracing::debug!("Adaptive controller loop stopped");
        });
    }

    // 后台注册循环：固定间隔重试直到成功，成功后开始心跳
    fn spawn_background_register(self: &Arc<Self>) {
        let agent = self.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.register_retry_interval();

        self.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match agent.register_once().await {
                    Ok(instance_id) => {
                        tracing::info!(
                            instance_id = %instance_id,
                            "Background registration succeeded, starting heartbeats"
                        );
                        agent.spawn_heartbeat_loop();
                        agent.spawn_controller_loop();
                        return;
                    }
                    Err(e) if e.is_fatal() => {
                        tracing::error!(error = %e, "Background registration hit fatal error");
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Background registration attempt failed");
                    }
                }
            }
        });
    }

    /// 优雅停机：补发一次带 2 秒限期的心跳，然后注销并等待后台任务退出
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        if let Some(instance_id) = self.instance_id() {
            let _ = tokio::time::timeout(SHUTDOWN_HEARTBEAT_DEADLINE, self.heartbeat_once()).await;
            match self.deregister_once(instance_id).await {
                Ok(()) => {
                    tracing::info!(instance_id = %instance_id, "Deregistered on shutdown")
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Deregistration on shutdown failed")
                }
            }
        }

        self.task_tracker.close();
        self.task_tracker.wait().await;
    }
}
