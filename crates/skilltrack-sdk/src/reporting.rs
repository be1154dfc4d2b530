//! 死信上报 - 终态失败的运维可见性
//!
//! 记录转入 failed_terminal 后不再参与任何批次，
//! 但必须被看见：上报接口是一个能力边界，宿主可接入
//! 自己的错误上报系统；默认实现只写结构化日志。

use async_trait::async_trait;
use tracing::warn;

use crate::storage::entities::EntityType;

/// 死信上报能力接口
#[async_trait]
pub trait DeadLetterReporter: Send + Sync {
    async fn report(&self, record_id: &str, entity_type: EntityType, terminal_reason: &str);
}

/// 默认上报实现：结构化日志输出
pub struct LoggingReporter;

#[async_trait]
impl DeadLetterReporter for LoggingReporter {
    async fn report(&self, record_id: &str, entity_type: EntityType, terminal_reason: &str) {
        warn!(
            record_id = %record_id,
            entity_type = %entity_type,
            reason = %terminal_reason,
            "⚠️ 变更进入死信"
        );
    }
}
