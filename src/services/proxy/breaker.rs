use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::BreakerConfig;

/// 熔断器状态机：Closed -> Open -> HalfOpen -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// 准入判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 正常放行
    Allowed,
    /// 半开状态下的唯一探测请求
    Probe,
    /// 熔断打开，直接拒绝
    Rejected,
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// 当前打开时长，半开探测失败后翻倍直到上限
    open_duration: Duration,
    probe_in_flight: bool,
    open_transitions: u64,
}

/// 单个目标实例的熔断器。状态迁移全部在互斥区内完成，
/// 一轮失败爆发只产生一次 Closed -> Open。
#[derive(Debug)]
pub struct CircuitBreaker {
    core: Mutex<BreakerCore>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let open_duration = config.open_duration();
        Self {
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                open_duration,
                probe_in_flight: false,
                open_transitions: 0,
            }),
            config,
        }
    }

    /// 请求准入。Open 到期时迁移到 HalfOpen 并放行单个探测。
    pub fn admit(&self) -> Admission {
        let mut core = self.core.lock().unwrap();
        match core.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let expired = core
                    .opened_at
                    .map(|at| at.elapsed() >= core.open_duration)
                    .unwrap_or(true);
                if !expired {
                    return Admission::Rejected;
                }
                core.state = BreakerState::HalfOpen;
                core.probe_in_flight = true;
                tracing::info!("Circuit breaker half-open, admitting probe request");
                Admission::Probe
            }
            BreakerState::HalfOpen => {
                if core.probe_in_flight {
                    Admission::Rejected
                } else {
                    core.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// 上游成功：半开探测成功回到 Closed，计数与打开时长复位
    pub fn on_success(&self) {
        let mut core = self.core.lock().unwrap();
        if core.state != BreakerState::Closed {
            tracing::info!("Circuit breaker closed after successful probe");
        }
        core.state = BreakerState::Closed;
        core.consecutive_failures = 0;
        core.opened_at = None;
        core.open_duration = self.config.open_duration();
        core.probe_in_flight = false;
    }

    /// 上游失败：Closed 累计到阈值后打开一次；
    /// 半开探测失败则回到 Open 并把打开时长翻倍（封顶）。
    pub fn on_failure(&self) {
        let mut core = self.core.lock().unwrap();
        match core.state {
            BreakerState::Closed => {
                core.consecutive_failures += 1;
                if core.consecutive_failures >= self.config.failure_threshold {
                    core.state = BreakerState::Open;
                    core.opened_at = Some(Instant::now());
                    core.open_transitions += 1;
                    tracing::warn!(
                        consecutive_failures = core.consecutive_failures,
                        open_secs = core.open_duration.as_secs(),
                        "Circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                core.state = BreakerState::Open;
                core.opened_at = Some(Instant::now());
                core.open_duration =
                    std::cmp::min(core.open_duration * 2, self.config.max_open_duration());
                core.probe_in_flight = false;
                core.open_transitions += 1;
                tracing::warn!(
                    open_secs = core.open_duration.as_secs(),
                    "Circuit breaker re-opened after failed probe"
                );
            }
            // Open 状态下不应有计数进来（拒绝的请求不算失败）
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.core.lock().unwrap().state
    }

    /// 历史上 Closed/HalfOpen -> Open 的迁移次数
    pub fn open_transitions(&self) -> u64 {
        self.core.lock().unwrap().open_transitions
    }
}

/// 每个目标实例一个熔断器；一个实例打开不影响同服务的其他实例
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<Uuid, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn get(&self, instance_id: Uuid) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(instance_id)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    /// 实例被移除后回收对应熔断器
    pub fn forget(&self, instance_id: &Uuid) {
        self.breakers.remove(instance_id);
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
