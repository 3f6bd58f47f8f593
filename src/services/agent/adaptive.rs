use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// 自适应心跳控制器配置。阈值全部可配，默认档位 10/20/60/30 秒。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// 滑动窗口长度（秒）
    pub window: u64,
    /// 重新分级周期（秒）
    pub tick: u64,
    pub interval_high: u64,
    pub interval_medium: u64,
    pub interval_low: u64,
    pub interval_base: u64,
    /// 窗口内请求数阈值
    pub high_request_count: usize,
    pub medium_request_count: usize,
    /// 平均时延阈值（毫秒）
    pub high_latency_ms: u64,
    pub medium_latency_ms: u64,
    /// 错误率阈值
    pub high_error_rate: f64,
    pub medium_error_rate: f64,
    /// 空闲降级所需的最短运行时间（秒）
    pub idle_uptime: u64,
    /// 连续失败后塌缩到的间隔（秒）
    pub failure_interval: u64,
    /// 连续失败多少次触发塌缩
    pub failure_collapse_after: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window: 60,
            tick: 10,
            interval_high: 10,
            interval_medium: 20,
            interval_low: 60,
            interval_base: 30,
            high_request_count: 100,
            medium_request_count: 50,
            high_latency_ms: 1000,
            medium_latency_ms: 500,
            high_error_rate: 0.5,
            medium_error_rate: 0.2,
            idle_uptime: 300, // 5分钟
            failure_interval: 5,
            failure_collapse_after: 3,
        }
    }
}

impl AdaptiveConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick)
    }

    pub fn interval_for(&self, level: LoadLevel) -> Duration {
        let secs = match level {
            LoadLevel::High => self.interval_high,
            LoadLevel::Medium => self.interval_medium,
            LoadLevel::Low => self.interval_low,
            LoadLevel::Normal => self.interval_base,
        };
        Duration::from_secs(secs)
    }

    pub fn failure_interval(&self) -> Duration {
        Duration::from_secs(self.failure_interval)
    }
}

/// 负载档位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadLevel {
    High,
    Medium,
    Low,
    Normal,
}

/// 窗口内聚合出的指标
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowStats {
    pub request_count: usize,
    pub avg_latency: Duration,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Copy)]
struct RequestSample {
    at: Instant,
    duration: Duration,
    success: bool,
}

/// 宿主应用埋点喂入的请求指标滑动窗口
#[derive(Debug, Default)]
pub struct MetricsWindow {
    samples: Mutex<VecDeque<RequestSample>>,
}

impl MetricsWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, duration: Duration, success: bool, window: Duration) {
        let mut samples = self.samples.lock().unwrap();
        samples.push_back(RequestSample {
            at: Instant::now(),
            duration,
            success,
        });
        Self::evict_old(&mut samples, window);
    }

    pub fn snapshot(&self, window: Duration) -> WindowStats {
        let mut samples = self.samples.lock().unwrap();
        Self::evict_old(&mut samples, window);

        let count = samples.len();
        if count == 0 {
            return WindowStats::default();
        }

        let total: Duration = samples.iter().map(|s| s.duration).sum();
        let failures = samples.iter().filter(|s| !s.success).count();
        WindowStats {
            request_count: count,
            avg_latency: total / count as u32,
            error_rate: failures as f64 / count as f64,
        }
    }

    fn evict_old(samples: &mut VecDeque<RequestSample>, window: Duration) {
        let now = Instant::now();
        while let Some(front) = samples.front() {
            if now.duration_since(front.at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// 心跳节奏控制器。每个 tick 按窗口指标重新分级，
/// 档位变化立即通过 watch 通道重排下一次心跳；
/// 连续失败把间隔塌缩到 failure_interval，成功后恢复。
pub struct HeartbeatController {
    config: AdaptiveConfig,
    started_at: Instant,
    level: Mutex<LoadLevel>,
    interval_tx: watch::Sender<Duration>,
    failure_streak: AtomicU32,
    collapsed: AtomicBool,
}

impl HeartbeatController {
    pub fn new(config: AdaptiveConfig, base_interval: Duration) -> (Self, watch::Receiver<Duration>) {
        let (interval_tx, interval_rx) = watch::channel(base_interval);
        (
            Self {
                config,
                started_at: Instant::now(),
                level: Mutex::new(LoadLevel::Normal),
                interval_tx,
                failure_streak: AtomicU32::new(0),
                collapsed: AtomicBool::new(false),
            },
            interval_rx,
        )
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// 按窗口指标与运行时长分级
    pub fn classify(&self, stats: &WindowStats, uptime: Duration) -> LoadLevel {
        let cfg = &self.config;
        if stats.request_count > cfg.high_request_count
            || stats.avg_latency > Duration::from_millis(cfg.high_latency_ms)
            || stats.error_rate > cfg.high_error_rate
        {
            return LoadLevel::High;
        }
        if stats.request_count > cfg.medium_request_count
            || stats.avg_latency > Duration::from_millis(cfg.medium_latency_ms)
            || stats.error_rate > cfg.medium_error_rate
        {
            return LoadLevel::Medium;
        }
        if stats.request_count == 0 && uptime > Duration::from_secs(cfg.idle_uptime) {
            return LoadLevel::Low;
        }
        LoadLevel::Normal
    }

    /// 控制器 tick：重新分级并在档位变化时重排心跳
    pub fn tick(&self, window: &MetricsWindow) {
        let stats = window.snapshot(self.config.window());
        let level = self.classify(&stats, self.started_at.elapsed());

        let mut current = self.level.lock().unwrap();
        if *current == level {
            return;
        }
        let previous = *current;
        tracing::debug!(
            previous_level = ?previous,
            new_level = ?level,
            request_count = stats.request_count,
            avg_latency_ms = stats.avg_latency.as_millis() as u64,
            error_rate = stats.error_rate,
            "Heartbeat load level changed"
        );
        *current = level;

        // 失败塌缩期间不被分级覆盖
        if !self.collapsed.load(Ordering::Acquire) {
            let _ = self.interval_tx.send(self.config.interval_for(level));
        }
    }

    /// 心跳结果反馈
    pub fn record_heartbeat_result(&self, success: bool) {
        if success {
            self.failure_streak.store(0, Ordering::Release);
            if self.collapsed.swap(false, Ordering::AcqRel) {
                let level = *self.level.lock().unwrap();
                let _ = self.interval_tx.send(self.config.interval_for(level));
                tracing::info!("Heartbeat recovered, restoring adaptive interval");
            }
            return;
        }

        let streak = self.failure_streak.fetch_add(1, Ordering::AcqRel) + 1;
        if streak >= self.config.failure_collapse_after
            && !self.collapsed.swap(true, Ordering::AcqRel)
        {
            tracing::warn!(
                consecutive_failures = streak,
                collapse_interval_secs = self.config.failure_interval,
                "Collapsing heartbeat interval after consecutive failures"
            );
            let _ = self.interval_tx.send(self.config.failure_interval());
        }
    }

    pub fn current_interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    pub fn current_level(&self) -> LoadLevel {
        *self.level.lock().unwrap()
    }
}
