use crate::error::SkilltrackSDKError;
use serde::{Deserialize, Serialize};

/// 同步失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncFailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 等待恢复后重试
    NetworkUnavailable,
    /// 服务端错误 - 根据状态码决定
    ServerError(u16),
    /// 限流 - 延迟重试
    RateLimited,
    /// 载荷被服务端结构性拒绝 - 不重试
    PayloadRejected(String),
    /// 服务端状态与本地历史冲突 - 终态，完整记录现场
    Conflict(String),
    /// 未知错误
    Unknown(String),
}

impl SyncFailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncFailureReason::NetworkTimeout => true,
            SyncFailureReason::NetworkUnavailable => true,
            // 5xx 服务端错误可重试，4xx 客户端错误不重试
            SyncFailureReason::ServerError(code) => *code >= 500 && *code < 600,
            SyncFailureReason::RateLimited => true,
            SyncFailureReason::PayloadRejected(_) => false,
            SyncFailureReason::Conflict(_) => false,
            // 保守策略：未知错误可重试
            SyncFailureReason::Unknown(_) => true,
        }
    }
}

impl From<SkilltrackSDKError> for SyncFailureReason {
    fn from(error: SkilltrackSDKError) -> Self {
        match error {
            SkilltrackSDKError::Timeout(_) => SyncFailureReason::NetworkTimeout,
            SkilltrackSDKError::Transport(msg) => {
                if msg.contains("timeout") {
                    SyncFailureReason::NetworkTimeout
                } else if msg.contains("unavailable") || msg.contains("connection") {
                    SyncFailureReason::NetworkUnavailable
                } else {
                    SyncFailureReason::Unknown(msg)
                }
            }
            SkilltrackSDKError::Validation(msg) => SyncFailureReason::PayloadRejected(msg),
            SkilltrackSDKError::Conflict(msg) => SyncFailureReason::Conflict(msg),
            SkilltrackSDKError::IO(_) => SyncFailureReason::NetworkUnavailable,
            other => SyncFailureReason::Unknown(other.to_string()),
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数，达到后转入终态
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)，只增不减，保证延迟序列单调不减
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 300_000, // 5分钟
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 计算第 N 次失败后的退避延迟（毫秒）
    ///
    /// attempts 从 1 开始计（记录已尝试的次数）。
    pub fn delay_for_attempt(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1).min(20);
        let base = self.base_delay_ms as f64 * self.backoff_factor.powi(exp as i32);
        let jitter = base * self.jitter_factor * rand::random::<f64>();
        ((base + jitter) as u64).min(self.max_delay_ms)
    }

    /// 计算下次重试的绝对时间戳（毫秒）
    pub fn next_attempt_at(&self, now_ms: i64, attempts: u32) -> i64 {
        now_ms + self.delay_for_attempt(attempts) as i64
    }

    /// 检查是否还应重试
    pub fn should_retry(&self, attempts: u32, reason: &SyncFailureReason) -> bool {
        attempts < self.max_attempts && reason.is_retryable()
    }
}

/// 重试决策结果
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// 在指定时间之后重试
    RetryAt(i64),
    /// 转入终态
    GiveUp,
}

/// 重试状态管理器
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 处理一次同步失败，给出重试决策
    pub fn on_failure(&self, attempts: u32, reason: &SyncFailureReason, now_ms: i64) -> RetryDecision {
        if !self.policy.should_retry(attempts, reason) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAt(self.policy.next_attempt_at(now_ms, attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_retryable() {
        assert!(SyncFailureReason::NetworkTimeout.is_retryable());
        assert!(SyncFailureReason::NetworkUnavailable.is_retryable());
        assert!(SyncFailureReason::ServerError(500).is_retryable());
        assert!(!SyncFailureReason::ServerError(404).is_retryable());
        assert!(SyncFailureReason::RateLimited.is_retryable());
        assert!(!SyncFailureReason::PayloadRejected("bad".to_string()).is_retryable());
        assert!(!SyncFailureReason::Conflict("diverged".to_string()).is_retryable());
    }

    #[test]
    fn test_timeout_maps_to_retryable_reason() {
        let reason: SyncFailureReason =
            SkilltrackSDKError::Timeout("send timeout".to_string()).into();
        assert_eq!(reason, SyncFailureReason::NetworkTimeout);
        assert!(reason.is_retryable());
    }

    #[test]
    fn test_delays_non_decreasing_up_to_cap() {
        let policy = RetryPolicy::default();
        // 抖动只增不减，基数指数增长（因子 2 > 1 + 抖动上限），
        // 因此连续失败的延迟序列必然单调不减，直到封顶
        let mut last = 0u64;
        for attempts in 1..=10 {
            let delay = policy.delay_for_attempt(attempts);
            assert!(delay >= last || delay == policy.max_delay_ms);
            assert!(delay <= policy.max_delay_ms);
            last = delay.min(policy.max_delay_ms);
        }
        assert_eq!(policy.delay_for_attempt(20), policy.max_delay_ms);
    }

    #[test]
    fn test_retry_manager_decisions() {
        let manager = RetryManager::new(RetryPolicy::default());
        let now = 1_000_000;

        match manager.on_failure(1, &SyncFailureReason::NetworkTimeout, now) {
            RetryDecision::RetryAt(at) => assert!(at > now),
            RetryDecision::GiveUp => panic!("first timeout must be retried"),
        }

        // 结构性拒绝立即放弃
        assert_eq!(
            manager.on_failure(0, &SyncFailureReason::PayloadRejected("bad".to_string()), now),
            RetryDecision::GiveUp
        );

        // 达到尝试上限后放弃
        assert_eq!(
            manager.on_failure(5, &SyncFailureReason::NetworkTimeout, now),
            RetryDecision::GiveUp
        );
    }
}
