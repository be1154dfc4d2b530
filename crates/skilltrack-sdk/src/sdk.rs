//! SDK 门面 - 学习流程的本地优先入口
//!
//! 前台路径只做两件事：写本地存储、登记待同步变更，
//! 然后立即返回；网络 I/O 全部发生在后台调度器里。
//! 学习者在离线状态下完成的每一步都先在本地生效。

use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::content::ContentProvider;
use crate::error::{Result, SkilltrackSDKError};
use crate::events::{EventBus, SdkEvent};
use crate::idempotency;
use crate::network::{NetworkMonitor, NetworkState};
use crate::reporting::DeadLetterReporter;
use crate::storage::entities::{
    AchievementRecord, AnswerRecord, EntityType, ProgressRecord, ProgressStatus,
};
use crate::storage::queue::MutationRecord;
use crate::storage::StorageManager;
use crate::sync::{BonusClock, SyncConfig, SyncScheduler, SyncStatusSnapshot};
use crate::transport::TransportClient;

/// 进度变更优先级高于积分与成就，会话最低
const PRIORITY_PROGRESS: i32 = 1;
const PRIORITY_POINTS: i32 = 2;
const PRIORITY_ACHIEVEMENT: i32 = 3;
const PRIORITY_SESSION: i32 = 5;

/// 用时不超过课程时长一半时的奖励分
const PERSONAL_BEST_BONUS: i64 = 5;

/// SDK 配置
#[derive(Debug, Clone)]
pub struct SdkConfig {
    /// 数据根目录（每个学习者一个子目录）
    pub base_path: PathBuf,
    pub sync: SyncConfig,
}

impl SdkConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            sync: SyncConfig::default(),
        }
    }
}

/// 一次课程完成的结果
#[derive(Debug, Clone)]
pub struct LessonCompletion {
    pub progress: ProgressRecord,
    /// 本次新发放的积分（重复完成为 0）
    pub points_awarded: i64,
}

/// 离线优先学习 SDK
pub struct SkilltrackSDK {
    storage: Arc<StorageManager>,
    scheduler: Arc<SyncScheduler>,
    network: NetworkMonitor,
    events: EventBus,
    content: Arc<dyn ContentProvider>,
    bonus_clock: BonusClock,
}

impl SkilltrackSDK {
    pub async fn new(
        config: SdkConfig,
        transport: Arc<dyn TransportClient>,
        content: Arc<dyn ContentProvider>,
        reporter: Arc<dyn DeadLetterReporter>,
    ) -> Result<Self> {
        let storage = Arc::new(StorageManager::new(&config.base_path).await?);
        let network = NetworkMonitor::new();
        let events = EventBus::new();
        let bonus_clock = config.sync.bonus_clock;
        let scheduler = Arc::new(SyncScheduler::new(
            Arc::clone(&storage),
            transport,
            network.clone(),
            events.clone(),
            reporter,
            config.sync,
        ));

        info!("🚀 SkilltrackSDK 初始化完成: {:?}", config.base_path);
        Ok(Self {
            storage,
            scheduler,
            network,
            events,
            content,
            bonus_clock,
        })
    }

    /// 登录学习者并启动后台同步循环
    pub async fn sign_in(&self, learner_id: &str) -> Result<()> {
        self.storage.init_learner(learner_id).await?;
        self.storage.switch_learner(learner_id).await?;
        self.scheduler.start();
        info!("👤 学习者已登录: {}", learner_id);
        Ok(())
    }

    /// 切换到另一个学习者（数据完全隔离）
    pub async fn switch_learner(&self, learner_id: &str) -> Result<()> {
        self.storage.init_learner(learner_id).await?;
        self.storage.switch_learner(learner_id).await
    }

    pub fn shutdown(&self) {
        self.scheduler.stop();
        info!("👋 SkilltrackSDK 已关闭");
    }

    /// 宿主应用上报网络状态；恢复在线会唤醒同步
    pub fn set_network_state(&self, state: NetworkState) {
        self.network.set_state(state);
    }

    // ============================================================
    // 学习流程（全部本地优先，绝不等待网络）
    // ============================================================

    /// 开始一节课
    pub async fn start_lesson(&self, lesson_id: &str) -> Result<ProgressRecord> {
        if !self.content.is_lesson_available(lesson_id).await {
            return Err(SkilltrackSDKError::LessonUnavailable(lesson_id.to_string()));
        }
        self.storage
            .advance_progress(lesson_id, ProgressStatus::InProgress, 0, 0, 0)
            .await
    }

    /// 提交一次作答（同题重答为替换）
    pub async fn submit_answer(
        &self,
        lesson_id: &str,
        question_id: &str,
        correct: bool,
        score: i64,
    ) -> Result<()> {
        let answer = AnswerRecord {
            lesson_id: lesson_id.to_string(),
            question_id: question_id.to_string(),
            correct,
            score,
            answered_at: Utc::now().timestamp_millis(),
        };
        self.storage.record_answer(&answer).await?;
        debug!("📝 作答记录: {}:{} correct={}", lesson_id, question_id, correct);
        Ok(())
    }

    /// 完成一节课
    ///
    /// 本地落进度、记积分流水、登记两条待同步变更
    /// （积分变更依赖进度变更先被服务端确认）。
    /// 重复完成坍缩为无副作用成功，不二次发分。
    pub async fn complete_lesson(
        &self,
        lesson_id: &str,
        max_score: i64,
        time_spent_ms: i64,
        lesson_duration_ms: Option<i64>,
    ) -> Result<LessonCompletion> {
        if let Some(existing) = self.storage.get_progress(lesson_id).await? {
            if existing.status == ProgressStatus::Completed {
                debug!("课程已完成，重复调用坍缩: {}", lesson_id);
                return Ok(LessonCompletion {
                    progress: existing,
                    points_awarded: 0,
                });
            }
        }

        let answers = self.storage.answers_for_lesson(lesson_id).await?;
        let score: i64 = answers.iter().map(|a| a.score).sum();

        let progress = self
            .storage
            .advance_progress(lesson_id, ProgressStatus::Completed, score, max_score, time_spent_ms)
            .await?;

        // 进度变更：version 取该课程已记录的状态迁移次数，
        // 并发重复完成会派生出同一个键
        let progress_key =
            idempotency::derive_key(EntityType::Progress, lesson_id, progress.transitions as u64);
        let progress_mutation = MutationRecord::new(
            progress_key.clone(),
            EntityType::Progress,
            lesson_id.to_string(),
            json!({
                "status": progress.status.as_str(),
                "score": progress.score,
                "max_score": progress.max_score,
                "time_spent_ms": progress.time_spent_ms,
            }),
            PRIORITY_PROGRESS,
        );
        self.storage.enqueue_mutation(&progress_mutation).await?;

        let amount = score + self.personal_best_bonus(time_spent_ms, lesson_duration_ms);

        // 积分 version 只哈希稳定内容（金额、课程、迁移计数），
        // 不含发放时间戳：并发的重复完成必须派生出同一个键
        let version_input = json!({
            "amount": amount,
            "source": "lesson_completion",
            "lesson_id": lesson_id,
            "progress_transitions": progress.transitions,
        });
        let version = idempotency::content_version(&version_input.to_string());
        let points_key = idempotency::derive_key(EntityType::Points, lesson_id, version);
        let payload = json!({
            "amount": amount,
            "source": "lesson_completion",
            "lesson_id": lesson_id,
            "progress_transitions": progress.transitions,
            "awarded_at": self.award_timestamp().await?,
        });

        self.storage
            .append_ledger_entry(&points_key, "lesson_completion", Some(lesson_id), amount)
            .await?;
        let points_mutation = MutationRecord::new(
            points_key,
            EntityType::Points,
            lesson_id.to_string(),
            payload,
            PRIORITY_POINTS,
        )
        .with_depends_on(progress_key);
        self.storage.enqueue_mutation(&points_mutation).await?;

        let total = self.storage.total_points().await?;
        self.events.emit(SdkEvent::PointsChanged { total_points: total });
        info!("🎉 课程完成: {} +{} 分 (总分 {})", lesson_id, amount, total);

        self.scheduler.trigger_sync();
        Ok(LessonCompletion {
            progress,
            points_awarded: amount,
        })
    }

    /// 本地解锁成就（已解锁过则为无副作用成功）
    pub async fn unlock_achievement(
        &self,
        achievement_id: &str,
        title: &str,
        description: &str,
    ) -> Result<bool> {
        let record = AchievementRecord {
            achievement_id: achievement_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            unlocked_at: Utc::now().timestamp_millis(),
            sync_state: crate::storage::entities::SyncState::Pending,
        };
        if !self.storage.unlock_achievement_local(&record).await? {
            return Ok(false);
        }

        let seq = self.storage.next_sequence("achievement").await?;
        let key = idempotency::derive_key(EntityType::Achievement, achievement_id, seq);
        let mutation = MutationRecord::new(
            key,
            EntityType::Achievement,
            achievement_id.to_string(),
            json!({
                "title": title,
                "unlocked_at": record.unlocked_at,
            }),
            PRIORITY_ACHIEVEMENT,
        );
        self.storage.enqueue_mutation(&mutation).await?;

        self.events.emit(SdkEvent::AchievementUnlocked {
            achievement_id: achievement_id.to_string(),
            title: title.to_string(),
        });
        self.scheduler.trigger_sync();
        Ok(true)
    }

    /// 记录一次学习会话（时长统计，服务端只做聚合）
    pub async fn record_study_session(&self, duration_ms: i64) -> Result<()> {
        let learner_id = self.storage.current_learner().await?;
        let seq = self.storage.next_sequence("session").await?;
        let key = idempotency::derive_key(EntityType::Session, &learner_id, seq);
        let mutation = MutationRecord::new(
            key,
            EntityType::Session,
            learner_id,
            json!({
                "duration_ms": duration_ms,
                "ended_at": Utc::now().timestamp_millis(),
            }),
            PRIORITY_SESSION,
        );
        self.storage.enqueue_mutation(&mutation).await?;
        Ok(())
    }

    // ============================================================
    // 查询与同步控制
    // ============================================================

    pub async fn progress(&self, lesson_id: &str) -> Result<Option<ProgressRecord>> {
        self.storage.get_progress(lesson_id).await
    }

    /// 展示总分（服务端基线 + 未同步本地流水）
    pub async fn total_points(&self) -> Result<i64> {
        self.storage.total_points().await
    }

    pub async fn streak_days(&self) -> Result<u32> {
        self.storage.streak_days().await
    }

    pub async fn achievements(&self) -> Result<Vec<AchievementRecord>> {
        self.storage.achievements().await
    }

    /// UI 层只读状态快照
    pub async fn sync_status(&self) -> Result<SyncStatusSnapshot> {
        self.scheduler.status().await
    }

    /// 强制同步请求（不等待结果）
    pub fn trigger_sync(&self) {
        self.scheduler.trigger_sync();
    }

    /// 强制同步并等待本次运行结束（含被合并的追加运行）
    pub async fn sync_now(&self) {
        self.scheduler.run_to_completion().await;
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SdkEvent> {
        self.events.subscribe()
    }

    /// 显式数据重置 - 唯一删除本地进度的路径
    pub async fn reset_learner_data(&self) -> Result<()> {
        self.storage.reset_learner_data().await
    }

    fn personal_best_bonus(&self, time_spent_ms: i64, lesson_duration_ms: Option<i64>) -> i64 {
        match lesson_duration_ms {
            Some(duration) if duration > 0 && time_spent_ms * 2 <= duration => PERSONAL_BEST_BONUS,
            _ => 0,
        }
    }

    /// 发放时间戳的时钟基准（显式配置项，不做隐藏默认）
    async fn award_timestamp(&self) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        Ok(match self.bonus_clock {
            BonusClock::Client => now,
            BonusClock::Server => now + self.storage.server_clock_offset_ms().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::LocalContentRegistry;
    use crate::reporting::LoggingReporter;
    use crate::storage::entities::SyncState;
    use crate::storage::queue::RetryPolicy;
    use crate::transport::{
        MutationOutcome, ReconciliationResult, SyncBatchResult,
    };
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// 幂等服务端桩：首次见到的键 ack，之后 duplicate，
    /// 权威总分 = 所有已生效积分变更之和。
    struct FakeServer {
        applied_keys: StdMutex<HashSet<String>>,
        total_points: StdMutex<i64>,
        fail_first_n: AtomicUsize,
    }

    impl FakeServer {
        fn new() -> Arc<Self> {
            Self::failing_first(0)
        }

        fn failing_first(n: usize) -> Arc<Self> {
            Arc::new(Self {
                applied_keys: StdMutex::new(HashSet::new()),
                total_points: StdMutex::new(0),
                fail_first_n: AtomicUsize::new(n),
            })
        }
    }

    #[async_trait]
    impl TransportClient for FakeServer {
        async fn send_batch(&self, batch: &[MutationRecord]) -> Result<SyncBatchResult> {
            if self
                .fail_first_n
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SkilltrackSDKError::Timeout("send timeout".to_string()));
            }

            let mut applied = self.applied_keys.lock().unwrap();
            let mut total = self.total_points.lock().unwrap();
            let mut outcomes = HashMap::new();
            for record in batch {
                if applied.insert(record.idempotency_key.clone()) {
                    if record.entity_type == EntityType::Points {
                        *total += record.payload["amount"].as_i64().unwrap_or(0);
                    }
                    outcomes.insert(record.idempotency_key.clone(), MutationOutcome::Acked);
                } else {
                    outcomes.insert(record.idempotency_key.clone(), MutationOutcome::Duplicate);
                }
            }
            Ok(SyncBatchResult {
                outcomes,
                reconciliation: Some(ReconciliationResult {
                    total_points: *total,
                    streak_days: 1,
                    new_achievements: vec![],
                    server_time_ms: None,
                }),
            })
        }
    }

    async fn sdk_with(server: Arc<FakeServer>) -> (SkilltrackSDK, Arc<LocalContentRegistry>, TempDir) {
        let dir = TempDir::new().unwrap();
        let content = Arc::new(LocalContentRegistry::new());
        let mut config = SdkConfig::new(dir.path());
        config.sync.retry_policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 100,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        };
        let sdk = SkilltrackSDK::new(config, server, content.clone(), Arc::new(LoggingReporter))
        .await
        .unwrap();
        sdk.sign_in("learner").await.unwrap();
        (sdk, content, dir)
    }

    async fn complete_l1_offline(sdk: &SkilltrackSDK, content: &LocalContentRegistry) -> LessonCompletion {
        content.mark_available("L1").await;
        sdk.start_lesson("L1").await.unwrap();
        for i in 1..=5 {
            sdk.submit_answer("L1", &format!("q{}", i), true, 10).await.unwrap();
        }
        sdk.complete_lesson("L1", 50, 90_000, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_offline_completion_then_sync() {
        let (sdk, content, _dir) = sdk_with(FakeServer::new()).await;

        // 离线完成：5 题 50 分，本地立即可见
        let completion = complete_l1_offline(&sdk, &content).await;
        assert_eq!(completion.points_awarded, 50);
        assert_eq!(sdk.total_points().await.unwrap(), 50);
        let status = sdk.sync_status().await.unwrap();
        assert_eq!(status.pending_count, 2); // 1 进度 + 1 积分

        // 网络恢复并同步
        sdk.set_network_state(NetworkState::Online);
        sdk.sync_now().await;

        let progress = sdk.progress("L1").await.unwrap().unwrap();
        assert_eq!(progress.status, ProgressStatus::Completed);
        assert_eq!(progress.sync_state, SyncState::Synced);
        assert_eq!(sdk.total_points().await.unwrap(), 50);
        assert_eq!(sdk.sync_status().await.unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_timeout_retry_does_not_double_award() {
        let server = FakeServer::failing_first(1);
        let (sdk, content, _dir) = sdk_with(server).await;

        complete_l1_offline(&sdk, &content).await;
        sdk.set_network_state(NetworkState::Online);

        // 首次同步超时，重试后成功
        sdk.sync_now().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        sdk.sync_now().await;

        // 最终恰好 50 分，不是 100
        assert_eq!(sdk.total_points().await.unwrap(), 50);
        assert_eq!(sdk.sync_status().await.unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_double_completion_collapses() {
        let (sdk, content, _dir) = sdk_with(FakeServer::new()).await;

        let first = complete_l1_offline(&sdk, &content).await;
        assert_eq!(first.points_awarded, 50);

        // 快速重复点击"完成"
        let second = sdk.complete_lesson("L1", 50, 90_000, None).await.unwrap();
        assert_eq!(second.points_awarded, 0);

        assert_eq!(sdk.total_points().await.unwrap(), 50);
        assert_eq!(sdk.sync_status().await.unwrap().pending_count, 2);
    }

    #[tokio::test]
    async fn test_unavailable_lesson_rejected() {
        let (sdk, _content, _dir) = sdk_with(FakeServer::new()).await;

        match sdk.start_lesson("ghost").await {
            Err(SkilltrackSDKError::LessonUnavailable(id)) => assert_eq!(id, "ghost"),
            other => panic!("expected LessonUnavailable, got {:?}", other.map(|r| r.lesson_id)),
        }
    }

    #[tokio::test]
    async fn test_personal_best_bonus_applies() {
        let (sdk, content, _dir) = sdk_with(FakeServer::new()).await;
        content.mark_available("L2").await;

        sdk.start_lesson("L2").await.unwrap();
        sdk.submit_answer("L2", "q1", true, 10).await.unwrap();
        // 用时不到课程时长一半：加奖励分
        let completion = sdk.complete_lesson("L2", 10, 30_000, Some(120_000)).await.unwrap();
        assert_eq!(completion.points_awarded, 10 + PERSONAL_BEST_BONUS);
    }

    #[tokio::test]
    async fn test_achievement_unlock_idempotent() {
        let (sdk, _content, _dir) = sdk_with(FakeServer::new()).await;

        assert!(sdk.unlock_achievement("a1", "First!", "desc").await.unwrap());
        assert!(!sdk.unlock_achievement("a1", "First!", "desc").await.unwrap());

        assert_eq!(sdk.achievements().await.unwrap().len(), 1);
        assert_eq!(sdk.sync_status().await.unwrap().pending_count, 1);
    }

    #[tokio::test]
    async fn test_learner_isolation() {
        let (sdk, content, _dir) = sdk_with(FakeServer::new()).await;
        complete_l1_offline(&sdk, &content).await;
        assert_eq!(sdk.total_points().await.unwrap(), 50);

        sdk.switch_learner("other").await.unwrap();
        assert_eq!(sdk.total_points().await.unwrap(), 0);
        assert!(sdk.progress("L1").await.unwrap().is_none());

        sdk.switch_learner("learner").await.unwrap();
        assert_eq!(sdk.total_points().await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_reset_is_the_only_delete_path() {
        let (sdk, content, _dir) = sdk_with(FakeServer::new()).await;
        complete_l1_offline(&sdk, &content).await;

        sdk.set_network_state(NetworkState::Online);
        sdk.sync_now().await;
        // 同步从不删除进度
        assert!(sdk.progress("L1").await.unwrap().is_some());

        sdk.reset_learner_data().await.unwrap();
        assert!(sdk.progress("L1").await.unwrap().is_none());
    }
}
