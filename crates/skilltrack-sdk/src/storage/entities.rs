//! 数据实体定义 - 类型安全的数据传输
//!
//! 包含：
//! - 实体类型与同步状态枚举
//! - 学习进度记录（按课程，状态单调推进）
//! - 积分流水（append-only，按幂等键去重）
//! - 成就记录（服务端元数据优先，本地解锁时间保留）

use serde::{Deserialize, Serialize};
use std::fmt;

/// 变更所属的实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    /// 学习进度
    Progress,
    /// 积分
    Points,
    /// 成就
    Achievement,
    /// 学习会话
    Session,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Progress => "progress",
            EntityType::Points => "points",
            EntityType::Achievement => "achievement",
            EntityType::Session => "session",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "progress" => Some(EntityType::Progress),
            "points" => Some(EntityType::Points),
            "achievement" => Some(EntityType::Achievement),
            "session" => Some(EntityType::Session),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 本地实体相对服务端的同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// 存在未确认的本地变更
    Pending,
    /// 服务端已确认
    Synced,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncState::Pending),
            "synced" => Some(SyncState::Synced),
            _ => None,
        }
    }
}

/// 课程学习状态（只能前进，不能回退）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(ProgressStatus::NotStarted),
            "in_progress" => Some(ProgressStatus::InProgress),
            "completed" => Some(ProgressStatus::Completed),
            _ => None,
        }
    }

    /// 单调序：upsert 时只允许 rank 上升
    pub fn rank(&self) -> u8 {
        match self {
            ProgressStatus::NotStarted => 0,
            ProgressStatus::InProgress => 1,
            ProgressStatus::Completed => 2,
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 按 (学习者, 课程) 维度的进度记录
///
/// `transitions` 是该课程已记录的状态迁移次数，
/// 作为进度变更幂等键的 version 输入。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub learner_id: String,
    pub lesson_id: String,
    pub status: ProgressStatus,
    pub score: i64,
    pub max_score: i64,
    pub time_spent_ms: i64,
    pub transitions: i64,
    pub sync_state: SyncState,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 单题作答记录（同题重答为替换，不追加）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub lesson_id: String,
    pub question_id: String,
    pub correct: bool,
    pub score: i64,
    pub answered_at: i64,
}

/// 积分流水条目（append-only）
///
/// 展示总分 = 服务端确认基线 + 未同步流水折叠求和，
/// 绝不使用可变计数器原地累加。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsLedgerEntry {
    pub id: i64,
    pub idempotency_key: String,
    pub source: String,
    pub lesson_id: Option<String>,
    pub amount: i64,
    pub sync_state: SyncState,
    pub created_at: i64,
}

/// 成就记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AchievementRecord {
    pub achievement_id: String,
    pub title: String,
    pub description: String,
    /// 本地首次解锁时间；服务端合并时保留，避免重复触发庆祝动效
    pub unlocked_at: i64,
    pub sync_state: SyncState,
}
