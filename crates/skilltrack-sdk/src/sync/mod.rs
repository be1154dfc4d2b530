//! 同步模块 - 调度器与协调引擎
//!
//! 调度器是变更队列的唯一排空者（单写者保证），
//! 协调引擎负责把服务端权威状态合并回本地。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::storage::queue::RetryPolicy;

pub mod reconcile;
pub mod scheduler;

pub use reconcile::Reconciler;
pub use scheduler::SyncScheduler;

/// 调度器状态机
///
/// Idle -> Checking -> Draining -> Reconciling -> Idle；
/// 可恢复失败进入 Backoff，到点或被强制同步打断后重入 Checking。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Checking,
    Draining,
    Reconciling,
    Backoff { until_ms: i64 },
}

/// 奖励时间基准
///
/// 离线练习中"个人最佳"奖励的用时比较基于哪个时钟：
/// Client 用本地时钟，Server 用本地时钟加上最近一次同步
/// 估计出的服务端偏移。显式配置，不做隐藏默认。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BonusClock {
    Client,
    Server,
}

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 单批次最大记录数
    pub batch_max_items: usize,
    /// 单批次最大字节数
    pub batch_max_bytes: usize,
    /// 单次传输调用超时
    pub transport_timeout: Duration,
    /// 周期性同步间隔
    pub periodic_interval: Duration,
    /// 重试策略
    pub retry_policy: RetryPolicy,
    /// 奖励时间基准
    pub bonus_clock: BonusClock,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_max_items: 32,
            batch_max_bytes: 256 * 1024,
            transport_timeout: Duration::from_secs(15),
            periodic_interval: Duration::from_secs(3600),
            retry_policy: RetryPolicy::default(),
            bonus_clock: BonusClock::Client,
        }
    }
}

/// 对 UI 层暴露的只读状态快照
#[derive(Debug, Clone)]
pub struct SyncStatusSnapshot {
    pub state: SchedulerState,
    /// 仍待同步的变更数（含在途与可重试）
    pub pending_count: u64,
    /// 死信数量，"N 项需要关注"
    pub dead_letter_count: u64,
    pub last_sync_at: Option<i64>,
    /// 展示总分（含未同步的本地流水）
    pub total_points: i64,
}
