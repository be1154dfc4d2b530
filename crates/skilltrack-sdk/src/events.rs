//! 事件系统 - UI 层的只读观察通道
//!
//! 基于 tokio broadcast：SDK 内部在状态变化时发布事件，
//! 任意多个订阅者（UI、日志、测试）独立消费。
//! 发布方不关心有没有订阅者，没有订阅者时事件直接丢弃。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::storage::entities::EntityType;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// SDK 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SdkEvent {
    /// 一次同步运行开始
    SyncStarted,
    /// 一次同步运行成功结束
    SyncCompleted {
        synced_count: usize,
        remaining_count: usize,
    },
    /// 一次同步运行因可恢复错误退避
    SyncDeferred { reason: String, retry_at_ms: i64 },
    /// 展示总分变化（含未同步的本地流水）
    PointsChanged { total_points: i64 },
    /// 新成就解锁（本地或服务端合并时首次见到）
    AchievementUnlocked {
        achievement_id: String,
        title: String,
    },
    /// 连续学习天数更新（服务端权威值）
    StreakUpdated { streak_days: u32 },
    /// 变更进入死信：需要人工关注
    MutationDeadLettered {
        record_id: String,
        entity_type: EntityType,
        reason: String,
    },
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SdkEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// 发布事件（无订阅者时静默丢弃）
    pub fn emit(&self, event: SdkEvent) {
        debug!("📢 发布事件: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
