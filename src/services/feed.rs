use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{ChangeKind, ChangesResponse, InstanceRecord, ServiceChangeEvent};

/// 变更源统计信息
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    /// 已记录的变更总数
    pub events_recorded: u64,
    /// 当前保留的墓碑数量
    pub tombstones: usize,
    /// 已裁剪的墓碑数量
    pub tombstones_pruned: u64,
    /// 全量快照应答次数
    pub full_snapshots_served: u64,
}

// 每个实例只保留最新一条（拉取协议只承诺收敛，不承诺逐事件历史）
#[derive(Debug, Clone)]
enum FeedEntry {
    Upserted {
        version: u64,
        record: InstanceRecord,
    },
    Removed {
        version: u64,
        removed_at: Instant,
    },
}

impl FeedEntry {
    fn version(&self) -> u64 {
        match self {
            FeedEntry::Upserted { version, .. } => *version,
            FeedEntry::Removed { version, .. } => *version,
        }
    }
}

#[derive(Debug, Default)]
struct FeedState {
    entries: HashMap<Uuid, FeedEntry>,
    current_version: u64,
    /// 低水位：小于等于它的游标无法增量应答，必须全量重置
    low_water: u64,
    stats: FeedStats,
}

/// 注册表的有序变更流。拉取端按版本合并应答，
/// 推送端经 broadcast 尽力投递，落后的订阅者被切断后走拉取对账。
#[derive(Debug)]
pub struct ChangeFeed {
    state: Mutex<FeedState>,
    sender: broadcast::Sender<ServiceChangeEvent>,
}

impl ChangeFeed {
    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity);
        Self {
            state: Mutex::new(FeedState::default()),
            sender,
        }
    }

    /// 记录一次写入或更新。由存储在其互斥区内调用，保证事件按版本序进入通道。
    pub(crate) fn record_upsert(&self, version: u64, record: InstanceRecord) {
        let event = ServiceChangeEvent {
            instance_id: record.instance_id,
            service_name: record.service_name.clone(),
            kind: ChangeKind::Upsert,
            version,
            record: Some(record.clone()),
        };

        {
            let mut state = self.state.lock().unwrap();
            debug_assert!(version > state.current_version);
            state.current_version = version;
            state.stats.events_recorded += 1;
            state
                .entries
                .insert(record.instance_id, FeedEntry::Upserted { version, record });
        }

        // 没有订阅者时 send 返回 Err，这不是故障
        let _ = self.sender.send(event);
    }

    /// 记录一次移除
    pub(crate) fn record_remove(&self, version: u64, instance_id: Uuid, service_name: String) {
        let event = ServiceChangeEvent {
            instance_id,
            service_name,
            kind: ChangeKind::Remove,
            version,
            record: None,
        };

        {
            let mut state = self.state.lock().unwrap();
            debug_assert!(version > state.current_version);
            state.current_version = version;
            state.stats.events_recorded += 1;
            state.entries.insert(
                instance_id,
                FeedEntry::Removed {
                    version,
                    removed_at: Instant::now(),
                },
            );
        }

        let _ = self.sender.send(event);
    }

    /// 拉取自 since 以来的变更。应答对每个实例只含最新状态；
    /// since 早于低水位时返回全量快照，调用方重置游标。
    pub fn changes_since(&self, since: u64) -> ChangesResponse {
        let mut state = self.state.lock().unwrap();

        if since < state.low_water {
            state.stats.full_snapshots_served += 1;
            let added_or_updated = state
                .entries
                .values()
                .filter_map(|entry| match entry {
                    FeedEntry::Upserted { record, .. } => Some(record.clone()),
                    FeedEntry::Removed { .. } => None,
                })
                .collect();

            return ChangesResponse {
                version: state.current_version,
                added_or_updated,
                removed: Vec::new(),
                full_snapshot: true,
            };
        }

        let mut added_or_updated = Vec::new();
        let mut removed = Vec::new();
        for (id, entry) in state.entries.iter() {
            if entry.version() <= since {
                continue;
            }
            match entry {
                FeedEntry::Upserted { record, .. } => added_or_updated.push(record.clone()),
                FeedEntry::Removed { .. } => removed.push(*id),
            }
        }

        ChangesResponse {
            version: state.current_version,
            added_or_updated,
            removed,
            full_snapshot: false,
        }
    }

    /// 订阅推送通道
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceChangeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn current_version(&self) -> u64 {
        self.state.lock().unwrap().current_version
    }

    /// 裁剪超过保留期的墓碑并抬升低水位，返回裁剪数量
    pub fn prune_tombstones(&self, retention: std::time::Duration) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut expired = Vec::new();

        for (id, entry) in state.entries.iter() {
            if let FeedEntry::Removed {
                version,
                removed_at,
            } = entry
            {
                if removed_at.elapsed() > retention {
                    expired.push((*id, *version));
                }
            }
        }

        for (id, version) in &expired {
            state.entries.remove(id);
            if *version > state.low_water {
                state.low_water = *version;
            }
        }

        let pruned = expired.len();
        if pruned > 0 {
            state.stats.tombstones_pruned += pruned as u64;
            tracing::debug!(
                pruned_count = pruned,
                low_water = state.low_water,
                "Pruned change feed tombstones"
            );
        }
        pruned
    }

    pub fn stats(&self) -> FeedStats {
        let state = self.state.lock().unwrap();
        let mut stats = state.stats.clone();
        stats.tombstones = state
            .entries
            .values()
            .filter(|e| matches!(e, FeedEntry::Removed { .. }))
            .count();
        stats
    }
}
