//! Skilltrack SDK - 离线优先学习同步引擎
//!
//! 让学习者在完全离线的状态下积累进度、积分与成就，
//! 网络恢复后与权威服务端协调，不丢失、不重复计数、不阻塞界面：
//! - 📝 本地优先：学习流程同步写本地存储，绝不等待网络
//! - 🔑 幂等变更队列：每条变更带确定性幂等键，重复提交坍缩为一条
//! - 🔄 单写者同步调度器：显式状态机驱动排空，退避重试有界
//! - 🧮 积分流水：append-only 账本 + 折叠求和，杜绝重复发分
//! - 🤝 协调引擎：服务端权威的总分/成就/连续天数合并回本地
//! - ⚙️ 事件系统：UI 层只读观察，强制同步之外不触碰内部
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use skilltrack_sdk::{
//!     LocalContentRegistry, LoggingReporter, NetworkState, SdkConfig, SkilltrackSDK,
//! };
//! # use skilltrack_sdk::{MutationRecord, SyncBatchResult, TransportClient};
//! # struct MyTransport;
//! # #[async_trait::async_trait]
//! # impl TransportClient for MyTransport {
//! #     async fn send_batch(&self, _: &[MutationRecord]) -> skilltrack_sdk::Result<SyncBatchResult> {
//! #         Ok(SyncBatchResult::default())
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let content = Arc::new(LocalContentRegistry::new());
//!     let sdk = SkilltrackSDK::new(
//!         SdkConfig::new("/path/to/data"),
//!         Arc::new(MyTransport),
//!         content.clone(),
//!         Arc::new(LoggingReporter),
//!     )
//!     .await?;
//!
//!     sdk.sign_in("learner-1").await?;
//!
//!     // 离线学习：全部本地生效
//!     content.mark_available("lesson-1").await;
//!     sdk.start_lesson("lesson-1").await?;
//!     sdk.submit_answer("lesson-1", "q1", true, 10).await?;
//!     sdk.complete_lesson("lesson-1", 10, 60_000, None).await?;
//!
//!     // 网络恢复，后台自动同步
//!     sdk.set_network_state(NetworkState::Online);
//!
//!     sdk.shutdown();
//!     Ok(())
//! }
//! ```

pub mod content;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod network;
pub mod reporting;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod transport;

pub use content::{ContentProvider, LocalContentRegistry};
pub use error::{Result, SkilltrackSDKError};
pub use events::{EventBus, SdkEvent};
pub use network::{NetworkMonitor, NetworkState};
pub use reporting::{DeadLetterReporter, LoggingReporter};
pub use sdk::{LessonCompletion, SdkConfig, SkilltrackSDK};
pub use storage::entities::{
    AchievementRecord, AnswerRecord, EntityType, PointsLedgerEntry, ProgressRecord,
    ProgressStatus, SyncState,
};
pub use storage::queue::{
    MutationRecord, MutationStatus, QueueStats, RetryDecision, RetryManager, RetryPolicy,
    SyncFailureReason,
};
pub use storage::StorageManager;
pub use sync::{BonusClock, SchedulerState, SyncConfig, SyncScheduler, SyncStatusSnapshot};
pub use transport::{
    MutationOutcome, ReconciliationResult, ServerAchievement, SyncBatchResult, TransportClient,
};
