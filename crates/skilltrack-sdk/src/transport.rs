//! 传输层能力接口 - 同步引擎与服务端之间的唯一边界
//!
//! 引擎只依赖这里定义的契约，不关心具体协议：
//! - 批量提交变更，得到逐条结果（acked / duplicate / rejected）
//! - 服务端必须兑现幂等键：重复提交已生效的键返回 duplicate，
//!   绝不二次发放
//!
//! 传输客户端自身不持久化任何状态。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::storage::queue::MutationRecord;

/// 单条变更的服务端结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationOutcome {
    /// 本次生效
    Acked,
    /// 幂等键已生效过，服务端按无操作成功处理
    Duplicate,
    /// 结构性拒绝，不应重试
    Rejected(String),
}

/// 服务端对一批变更的响应
#[derive(Debug, Clone, Default)]
pub struct SyncBatchResult {
    /// 按幂等键索引的逐条结果
    pub outcomes: HashMap<String, MutationOutcome>,
    /// 服务端权威状态（通常在批次末尾附带）
    pub reconciliation: Option<ReconciliationResult>,
}

impl SyncBatchResult {
    pub fn outcome_for(&self, idempotency_key: &str) -> Option<&MutationOutcome> {
        self.outcomes.get(idempotency_key)
    }
}

/// 服务端成就记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerAchievement {
    pub achievement_id: String,
    pub title: String,
    pub description: String,
    pub unlocked_at: i64,
}

/// 服务端权威状态
///
/// 不落库存储，消费一次即丢弃：积分基线、连续天数、新成就
/// 由协调引擎合并进本地状态。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationResult {
    /// 服务端确认的积分总数（新基线）
    pub total_points: i64,
    /// 服务端确认的连续学习天数
    pub streak_days: u32,
    /// 服务端侧新解锁的成就
    pub new_achievements: Vec<ServerAchievement>,
    /// 服务端时钟（毫秒），用于估计客户端时钟偏移
    pub server_time_ms: Option<i64>,
}

/// 传输客户端能力接口
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// 提交一批变更
    ///
    /// 返回 Err 表示整批传输失败（超时、连接拒绝、5xx），
    /// 调用方按可重试路径处理；逐条的业务结果在 Ok 里。
    async fn send_batch(&self, batch: &[MutationRecord]) -> Result<SyncBatchResult>;
}
