use crate::storage::entities::EntityType;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 变更记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationStatus {
    /// 等待同步
    Pending,
    /// 已进入在途批次
    InFlight,
    /// 服务端已确认
    Synced,
    /// 失败，等待退避后重试
    FailedRetryable,
    /// 终态失败（结构性拒绝或达到重试上限），保留用于诊断
    FailedTerminal,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::InFlight => "in_flight",
            MutationStatus::Synced => "synced",
            MutationStatus::FailedRetryable => "failed_retryable",
            MutationStatus::FailedTerminal => "failed_terminal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MutationStatus::Pending),
            "in_flight" => Some(MutationStatus::InFlight),
            "synced" => Some(MutationStatus::Synced),
            "failed_retryable" => Some(MutationStatus::FailedRetryable),
            "failed_terminal" => Some(MutationStatus::FailedTerminal),
            _ => None,
        }
    }

    /// 是否终态（终态记录不再进入任何批次）
    pub fn is_terminal(&self) -> bool {
        matches!(self, MutationStatus::Synced | MutationStatus::FailedTerminal)
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 一条不可变的变更意图
///
/// `id` 每条记录本地唯一，重试不复用；`idempotency_key` 由变更语义
/// 派生（实体类型 + 实体 ID + 逻辑版本），重试期间保持不变，
/// 是本地入队去重与服务端去重共同依赖的唯一机制。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: String,
    pub idempotency_key: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// 入队时刻的变更快照（JSON），之后绝不修改
    pub payload: serde_json::Value,
    pub status: MutationStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    /// 数值越小优先级越高
    pub priority: i32,
    pub created_at: i64,
    /// 退避闸门：早于该时刻不进入批次
    pub scheduled_not_before: i64,
    /// 前置变更的幂等键；前置未确认时本记录不会被选入批次
    pub depends_on: Option<String>,
}

impl MutationRecord {
    pub fn new(
        idempotency_key: String,
        entity_type: EntityType,
        entity_id: String,
        payload: serde_json::Value,
        priority: i32,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            idempotency_key,
            entity_type,
            entity_id,
            payload,
            status: MutationStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            priority,
            created_at: now,
            scheduled_not_before: now,
            depends_on: None,
        }
    }

    /// 声明对前置变更的依赖
    pub fn with_depends_on(mut self, key: String) -> Self {
        self.depends_on = Some(key);
        self
    }

    /// 估算记录大小（用于批次字节上限）
    pub fn estimated_size(&self) -> usize {
        self.payload.to_string().len() + self.entity_id.len() + 128
    }

    /// 退避闸门是否已放行
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.scheduled_not_before <= now_ms
    }

    pub fn mark_in_flight(&mut self) {
        self.status = MutationStatus::InFlight;
        self.attempts += 1;
        self.last_attempt_at = Some(Utc::now().timestamp_millis());
    }

    pub fn mark_synced(&mut self) {
        self.status = MutationStatus::Synced;
        self.last_error = None;
    }

    pub fn mark_failed_retryable(&mut self, error: String, not_before: i64) {
        self.status = MutationStatus::FailedRetryable;
        self.last_error = Some(error);
        self.scheduled_not_before = not_before;
    }

    pub fn mark_failed_terminal(&mut self, error: String) {
        self.status = MutationStatus::FailedTerminal;
        self.last_error = Some(error);
    }

    pub fn details(&self) -> String {
        format!(
            "MutationRecord(id={}, key={}, entity={}:{}, status={}, attempts={})",
            self.id,
            self.idempotency_key,
            self.entity_type,
            self.entity_id,
            self.status,
            self.attempts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> MutationRecord {
        MutationRecord::new(
            "key-1".to_string(),
            EntityType::Progress,
            "lesson-1".to_string(),
            json!({"status": "completed"}),
            1,
        )
    }

    #[test]
    fn test_new_record_is_pending_and_due() {
        let record = sample();
        assert_eq!(record.status, MutationStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.is_due(Utc::now().timestamp_millis()));
        assert!(record.depends_on.is_none());
    }

    #[test]
    fn test_ids_not_reused_across_records() {
        let a = sample();
        let b = sample();
        assert_ne!(a.id, b.id);
        assert_eq!(a.idempotency_key, b.idempotency_key);
    }

    #[test]
    fn test_retryable_failure_sets_gate() {
        let mut record = sample();
        record.mark_in_flight();
        assert_eq!(record.attempts, 1);

        let not_before = Utc::now().timestamp_millis() + 60_000;
        record.mark_failed_retryable("timeout".to_string(), not_before);
        assert_eq!(record.status, MutationStatus::FailedRetryable);
        assert!(!record.is_due(Utc::now().timestamp_millis()));
        assert!(record.is_due(not_before));
    }

    #[test]
    fn test_terminal_status() {
        let mut record = sample();
        record.mark_failed_terminal("malformed payload".to_string());
        assert!(record.status.is_terminal());
        assert_eq!(record.last_error.as_deref(), Some("malformed payload"));
    }
}
