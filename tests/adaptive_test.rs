use std::time::Duration;

use meshway::services::agent::{AdaptiveConfig, HeartbeatController, LoadLevel, MetricsWindow, WindowStats};

fn controller() -> HeartbeatController {
    let (controller, _rx) =
        HeartbeatController::new(AdaptiveConfig::default(), Duration::from_secs(30));
    controller
}

#[test]
fn high_load_classification_by_request_count() {
    let controller = controller();
    // 150 个成功请求、时延 <100ms：按请求数判 High
    let stats = WindowStats {
        request_count: 150,
        avg_latency: Duration::from_millis(80),
        error_rate: 0.0,
    };
    let level = controller.classify(&stats, Duration::from_secs(60));
    assert_eq!(level, LoadLevel::High);
    assert_eq!(
        controller.config().interval_for(level),
        Duration::from_secs(10)
    );
}

#[test]
fn high_load_classification_by_latency_and_errors() {
    let controller = controller();
    let slow = WindowStats {
        request_count: 10,
        avg_latency: Duration::from_millis(1500),
        error_rate: 0.0,
    };
    assert_eq!(controller.classify(&slow, Duration::ZERO), LoadLevel::High);

    let failing = WindowStats {
        request_count: 10,
        avg_latency: Duration::from_millis(50),
        error_rate: 0.6,
    };
    assert_eq!(controller.classify(&failing, Duration::ZERO), LoadLevel::High);
}

#[test]
fn medium_low_and_normal_levels() {
    let controller = controller();

    let medium = WindowStats {
        request_count: 60,
        avg_latency: Duration::from_millis(100),
        error_rate: 0.0,
    };
    assert_eq!(controller.classify(&medium, Duration::ZERO), LoadLevel::Medium);
    assert_eq!(
        controller.config().interval_for(LoadLevel::Medium),
        Duration::from_secs(20)
    );

    // 空窗口 + 运行超过 5 分钟才算空闲
    let idle = WindowStats::default();
    assert_eq!(
        controller.classify(&idle, Duration::from_secs(301)),
        LoadLevel::Low
    );
    assert_eq!(
        controller.config().interval_for(LoadLevel::Low),
        Duration::from_secs(60)
    );
    assert_eq!(
        controller.classify(&idle, Duration::from_secs(60)),
        LoadLevel::Normal
    );

    let light = WindowStats {
        request_count: 5,
        avg_latency: Duration::from_millis(20),
        error_rate: 0.0,
    };
    assert_eq!(controller.classify(&light, Duration::ZERO), LoadLevel::Normal);
}

#[test]
fn metrics_window_aggregates_and_evicts() {
    let window = MetricsWindow::new();
    let span = Duration::from_secs(60);

    window.record(Duration::from_millis(100), true, span);
    window.record(Duration::from_millis(300), false, span);

    let stats = window.snapshot(span);
    assert_eq!(stats.request_count, 2);
    assert_eq!(stats.avg_latency, Duration::from_millis(200));
    assert!((stats.error_rate - 0.5).abs() < f64::EPSILON);

    // 窗口为零时旧样本全部被驱逐
    let drained = window.snapshot(Duration::ZERO);
    assert_eq!(drained.request_count, 0);
}

#[tokio::test]
async fn consecutive_heartbeat_failures_collapse_interval() {
    let (controller, rx) =
        HeartbeatController::new(AdaptiveConfig::default(), Duration::from_secs(30));
    assert_eq!(controller.current_interval(), Duration::from_secs(30));

    controller.record_heartbeat_result(false);
    controller.record_heartbeat_result(false);
    assert_eq!(controller.current_interval(), Duration::from_secs(30));

    // 第三次连续失败：塌缩到 5 秒
    controller.record_heartbeat_result(false);
    assert_eq!(*rx.borrow(), Duration::from_secs(5));

    // 成功后恢复当前档位的间隔
    controller.record_heartbeat_result(true);
    assert_eq!(*rx.borrow(), Duration::from_secs(30));
}

#[tokio::test]
async fn tick_reschedules_on_level_change() {
    let (controller, rx) =
        HeartbeatController::new(AdaptiveConfig::default(), Duration::from_secs(30));
    let window = MetricsWindow::new();

    // 灌满高负载样本后 tick，间隔立即塌到 High 档
    for _ in 0..150 {
        window.record(Duration::from_millis(50), true, Duration::from_secs(60));
    }
    controller.tick(&window);
    assert_eq!(controller.current_level(), LoadLevel::High);
    assert_eq!(*rx.borrow(), Duration::from_secs(10));
}
