use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::InstanceRecord;

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalancerPolicy {
    RoundRobin,
    WeightedRoundRobin,
    Random,
    LeastInFlight,
}

/// 每个实例的在途请求计数，由代理维护，供 LeastInFlight 使用
#[derive(Debug, Default)]
pub struct InFlightTracker {
    counts: DashMap<Uuid, Arc<AtomicUsize>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求进入：返回的守卫在析构时递减
    pub fn begin(&self, instance_id: Uuid) -> InFlightGuard {
        let counter = self
            .counts
            .entry(instance_id)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { counter }
    }

    pub fn count(&self, instance_id: &Uuid) -> usize {
        self.counts
            .get(instance_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// 实例被驱逐后回收计数槽
    pub fn forget(&self, instance_id: &Uuid) {
        self.counts.remove(instance_id);
    }
}

pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// 纯选择函数：从候选列表中挑一个实例。
/// 轮询游标按服务名隔离；空列表永远返回 None。
pub struct LoadBalancer {
    policy: BalancerPolicy,
    cursors: DashMap<String, AtomicUsize>,
    in_flight: Arc<InFlightTracker>,
}

impl LoadBalancer {
    pub fn new(policy: BalancerPolicy, in_flight: Arc<InFlightTracker>) -> Self {
        Self {
            policy,
            cursors: DashMap::new(),
            in_flight,
        }
    }

    pub fn policy(&self) -> BalancerPolicy {
        self.policy
    }

    /// 实例被移除后回收其在途计数槽
    pub fn forget_instance(&self, instance_id: &Uuid) {
        self.in_flight.forget(instance_id);
    }

    pub fn select(
        &self,
        service_name: &str,
        candidates: &[InstanceRecord],
    ) -> Option<InstanceRecord> {
        // 权重为 0 的实例只注册不参选
        let eligible: Vec<&InstanceRecord> =
            candidates.iter().filter(|r| r.weight > 0).collect();
        if eligible.is_empty() {
            return None;
        }

        let selected = match self.policy {
            BalancerPolicy::RoundRobin => self.pick_round_robin(service_name, &eligible),
            BalancerPolicy::WeightedRoundRobin => self.pick_weighted(service_name, &eligible),
            BalancerPolicy::Random => Self::pick_random(&eligible),
            BalancerPolicy::LeastInFlight => self.pick_least_in_flight(service_name, &eligible),
        };

        Some(selected.clone())
    }

    fn advance_cursor(&self, service_name: &str) -> usize {
        self.cursors
            .entry(service_name.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    fn pick_round_robin<'a>(
        &self,
        service_name: &str,
        eligible: &[&'a InstanceRecord],
    ) -> &'a InstanceRecord {
        let idx = self.advance_cursor(service_name);
        eligible[idx % eligible.len()]
    }

    // 按权重展开成虚拟槽位后轮询，长期份额收敛到 weight_i / Σweight
    fn pick_weighted<'a>(
        &self,
        service_name: &str,
        eligible: &[&'a InstanceRecord],
    ) -> &'a InstanceRecord {
        let total: u64 = eligible.iter().map(|r| r.weight as u64).sum();
        let slot = (self.advance_cursor(service_name) as u64) % total;

        let mut acc = 0u64;
        for record in eligible {
            acc += record.weight as u64;
            if slot < acc {
                return record;
            }
        }
        eligible[eligible.len() - 1]
    }

    // 权重一致时退化为均匀随机，否则按权重加权
    fn pick_random<'a>(eligible: &[&'a InstanceRecord]) -> &'a InstanceRecord {
        let mut rng = rand::thread_rng();
        let uniform = eligible.iter().all(|r| r.weight == eligible[0].weight);
        if uniform {
            return eligible[rng.gen_range(0..eligible.len())];
        }

        let total: u64 = eligible.iter().map(|r| r.weight as u64).sum();
        let mut slot = rng.gen_range(0..total);
        for record in eligible {
            let weight = record.weight as u64;
            if slot < weight {
                return record;
            }
            slot -= weight;
        }
        eligible[eligible.len() - 1]
    }

    // 取在途请求最少的实例，并列时按轮询打破
    fn pick_least_in_flight<'a>(
        &self,
        service_name: &str,
        eligible: &[&'a InstanceRecord],
    ) -> &'a InstanceRecord {
        let min = eligible
            .iter()
            .map(|r| self.in_flight.count(&r.instance_id))
            .min()
            .unwrap_or(0);

        let tied: Vec<&'a InstanceRecord> = eligible
            .iter()
            .filter(|r| self.in_flight.count(&r.instance_id) == min)
            .copied()
            .collect();

        if tied.len() == 1 {
            return tied[0];
        }
        let idx = self.advance_cursor(service_name);
        tied[idx % tied.len()]
    }
}
