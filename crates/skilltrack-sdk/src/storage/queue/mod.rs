//! 变更队列模块 - 同步的基本单位
//!
//! 每条待同步的本地变更以 [`MutationRecord`] 形式持久化在
//! SQLite 的 mutation_queue 表中（见 dao::mutation_queue），
//! 本模块定义记录本身、状态机与重试策略。

use std::collections::HashMap;

pub mod mutation;
pub mod retry_policy;

pub use mutation::{MutationRecord, MutationStatus};
pub use retry_policy::{RetryDecision, RetryManager, RetryPolicy, SyncFailureReason};

/// 队列统计信息
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub synced: usize,
    pub failed_retryable: usize,
    pub failed_terminal: usize,
}

impl QueueStats {
    /// 仍会进入后续批次的记录数
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_flight + self.failed_retryable
    }

    pub fn from_status_counts(counts: &HashMap<MutationStatus, usize>) -> Self {
        let get = |s: MutationStatus| counts.get(&s).copied().unwrap_or(0);
        let stats = Self {
            pending: get(MutationStatus::Pending),
            in_flight: get(MutationStatus::InFlight),
            synced: get(MutationStatus::Synced),
            failed_retryable: get(MutationStatus::FailedRetryable),
            failed_terminal: get(MutationStatus::FailedTerminal),
            total: 0,
        };
        Self {
            total: stats.pending
                + stats.in_flight
                + stats.synced
                + stats.failed_retryable
                + stats.failed_terminal,
            ..stats
        }
    }
}
