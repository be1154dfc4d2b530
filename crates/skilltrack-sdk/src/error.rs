use std::fmt;
use rusqlite;

#[derive(Debug)]
pub enum SkilltrackSDKError {
    SqliteError(rusqlite::Error),
    JsonError(String),
    InvalidArgument(String),
    NotFound(String),
    AlreadyExists(String),
    Other(String),
    KvStore(String),
    Serialization(String),
    IO(String),
    Database(String),
    NotInitialized(String),
    Transport(String),      // 传输层错误（可恢复）
    Timeout(String),        // 网络调用超时（按可重试处理）
    Validation(String),     // 结构性拒绝（不可重试）
    Conflict(String),       // 服务端状态冲突（终态，保留现场日志）
    Config(String),
    QueueFull(String),
    InvalidOperation(String),
    ShuttingDown(String),
    LessonUnavailable(String), // 课程内容未下载到本地
}

impl fmt::Display for SkilltrackSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkilltrackSDKError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            SkilltrackSDKError::JsonError(e) => write!(f, "JSON error: {}", e),
            SkilltrackSDKError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            SkilltrackSDKError::NotFound(e) => write!(f, "Not found: {}", e),
            SkilltrackSDKError::AlreadyExists(e) => write!(f, "Already exists: {}", e),
            SkilltrackSDKError::Other(e) => write!(f, "Other error: {}", e),
            SkilltrackSDKError::KvStore(e) => write!(f, "KV store error: {}", e),
            SkilltrackSDKError::Serialization(e) => write!(f, "Serialization error: {}", e),
            SkilltrackSDKError::IO(e) => write!(f, "IO error: {}", e),
            SkilltrackSDKError::Database(e) => write!(f, "Database error: {}", e),
            SkilltrackSDKError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            SkilltrackSDKError::Transport(e) => write!(f, "Transport error: {}", e),
            SkilltrackSDKError::Timeout(e) => write!(f, "Timeout: {}", e),
            SkilltrackSDKError::Validation(e) => write!(f, "Validation error: {}", e),
            SkilltrackSDKError::Conflict(e) => write!(f, "Conflict: {}", e),
            SkilltrackSDKError::Config(e) => write!(f, "Config error: {}", e),
            SkilltrackSDKError::QueueFull(e) => write!(f, "Queue is full: {}", e),
            SkilltrackSDKError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            SkilltrackSDKError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            SkilltrackSDKError::LessonUnavailable(e) => write!(f, "Lesson unavailable: {}", e),
        }
    }
}

impl std::error::Error for SkilltrackSDKError {}

impl From<rusqlite::Error> for SkilltrackSDKError {
    fn from(error: rusqlite::Error) -> Self {
        SkilltrackSDKError::SqliteError(error)
    }
}

impl From<serde_json::Error> for SkilltrackSDKError {
    fn from(error: serde_json::Error) -> Self {
        SkilltrackSDKError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for SkilltrackSDKError {
    fn from(error: std::io::Error) -> Self {
        SkilltrackSDKError::IO(error.to_string())
    }
}

impl SkilltrackSDKError {
    /// 判断错误是否属于可恢复的传输类错误
    ///
    /// 可恢复错误走退避重试，绝不向学习流程抛出；
    /// 结构性拒绝（Validation / Conflict）进入终态。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SkilltrackSDKError::Transport(_)
                | SkilltrackSDKError::Timeout(_)
                | SkilltrackSDKError::IO(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SkilltrackSDKError>;
