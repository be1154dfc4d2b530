//! 存储模块 - 离线优先 SDK 的数据持久化层
//!
//! 采用分层架构设计：
//! - StorageManager: 统一的存储管理器，提供领域 API，外部不接触裸 SQL
//! - DAO Layer: 数据访问层，每张表一个专门的操作模块
//! - Entities: 数据实体定义，类型安全的数据传输
//! - KV: sled 同步元数据（积分基线、序号计数器、时钟偏移）
//!
//! 存储层独占所有实体；同步调度器只在 drain 期间持有临时内存引用。

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, SkilltrackSDKError};
use crate::idempotency::DedupCache;

pub mod dao;
pub mod entities;
pub mod kv;
pub mod queue;
pub mod sqlite;

pub use entities::*;
pub use queue::{MutationRecord, MutationStatus, QueueStats, RetryPolicy};

use dao::{AchievementDao, MutationQueueDao, PointsLedgerDao, ProgressDao};
use kv::{meta_keys, KvStore};
use sqlite::SqliteStore;

/// 统一的存储管理器
///
/// 学习流程（前台）与同步调度器（后台）都经由它写入；
/// 所有读改写路径要么是单条带唯一索引的 SQL，要么在事务内完成，
/// 保证前台入队与后台 drain 并发时幂等检查无竞态。
pub struct StorageManager {
    #[allow(dead_code)]
    base_path: PathBuf,
    sqlite: SqliteStore,
    kv: KvStore,
    dedup: DedupCache,
}

impl StorageManager {
    pub async fn new(base_path: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(base_path)
            .await
            .map_err(|e| SkilltrackSDKError::IO(format!("创建存储目录失败: {}", e)))?;

        Ok(Self {
            base_path: base_path.to_path_buf(),
            sqlite: SqliteStore::new(base_path).await?,
            kv: KvStore::new(base_path).await?,
            dedup: DedupCache::new(),
        })
    }

    /// 初始化学习者的数据库与元数据 Tree
    pub async fn init_learner(&self, learner_id: &str) -> Result<()> {
        self.sqlite.init_learner_database(learner_id).await?;
        self.kv.init_learner_tree(learner_id).await?;
        Ok(())
    }

    /// 切换当前学习者
    pub async fn switch_learner(&self, learner_id: &str) -> Result<()> {
        self.sqlite.switch_learner(learner_id).await?;
        self.kv.switch_learner(learner_id).await?;
        self.dedup.clear();
        Ok(())
    }

    pub async fn current_learner(&self) -> Result<String> {
        self.sqlite.current_learner().await
    }

    // ============================================================
    // 变更队列
    // ============================================================

    /// 幂等入队
    ///
    /// 同一幂等键重复入队（快速重复点击、重试路径重建变更）
    /// 坍缩为一条记录；返回 false 表示键已存在。
    pub async fn enqueue_mutation(&self, record: &MutationRecord) -> Result<bool> {
        if self.dedup.is_duplicate(&record.idempotency_key) {
            return Ok(false);
        }

        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        let inserted = MutationQueueDao::new(&conn).insert_if_absent(record)?;
        drop(conn);

        self.dedup.mark_seen(&record.idempotency_key);
        if inserted {
            debug!("变更已入队: {}", record.details());
        } else {
            debug!("🔄 重复变更已抑制: key={}", record.idempotency_key);
        }
        Ok(inserted)
    }

    pub async fn peek_batch(&self, max_items: usize, max_bytes: usize) -> Result<Vec<MutationRecord>> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        MutationQueueDao::new(&conn).peek_batch(max_items, max_bytes, now)
    }

    pub async fn mark_in_flight(&self, ids: &[String]) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        MutationQueueDao::new(&conn).mark_in_flight(ids, now)
    }

    pub async fn mark_mutations_synced(&self, keys: &[String]) -> Result<()> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        MutationQueueDao::new(&conn).mark_synced_by_keys(keys)
    }

    pub async fn mark_mutation_retryable(&self, id: &str, error: &str, not_before: i64) -> Result<()> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        MutationQueueDao::new(&conn).mark_failed_retryable(id, error, not_before)
    }

    pub async fn mark_mutation_terminal(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        MutationQueueDao::new(&conn).mark_failed_terminal(id, error)
    }

    pub async fn next_retry_due_at(&self) -> Result<Option<i64>> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        MutationQueueDao::new(&conn).next_retry_due_at()
    }

    pub async fn non_terminal_dependents_of(&self, key: &str) -> Result<Vec<MutationRecord>> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        MutationQueueDao::new(&conn).non_terminal_dependents_of(key)
    }

    pub async fn mutation_by_key(&self, key: &str) -> Result<Option<MutationRecord>> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        MutationQueueDao::new(&conn).get_by_key(key)
    }

    pub async fn pending_mutation_count(&self) -> Result<u64> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        MutationQueueDao::new(&conn).outstanding_count()
    }

    pub async fn dead_letter_count(&self) -> Result<u64> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        MutationQueueDao::new(&conn).dead_letter_count()
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        MutationQueueDao::new(&conn).stats()
    }

    // ============================================================
    // 进度
    // ============================================================

    pub async fn advance_progress(
        &self,
        lesson_id: &str,
        target: ProgressStatus,
        score: i64,
        max_score: i64,
        time_spent_ms: i64,
    ) -> Result<ProgressRecord> {
        let learner_id = self.current_learner().await?;
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        ProgressDao::new(&conn).advance_status(
            &learner_id,
            lesson_id,
            target,
            score,
            max_score,
            time_spent_ms,
        )
    }

    pub async fn record_answer(&self, answer: &AnswerRecord) -> Result<()> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        ProgressDao::new(&conn).record_answer(answer)
    }

    pub async fn answers_for_lesson(&self, lesson_id: &str) -> Result<Vec<AnswerRecord>> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        ProgressDao::new(&conn).answers_for_lesson(lesson_id)
    }

    pub async fn get_progress(&self, lesson_id: &str) -> Result<Option<ProgressRecord>> {
        let learner_id = self.current_learner().await?;
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        ProgressDao::new(&conn).get(&learner_id, lesson_id)
    }

    pub async fn mark_progress_synced(&self, lesson_id: &str) -> Result<()> {
        let learner_id = self.current_learner().await?;
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        ProgressDao::new(&conn).mark_synced(&learner_id, lesson_id)
    }

    // ============================================================
    // 积分流水
    // ============================================================

    pub async fn append_ledger_entry(
        &self,
        idempotency_key: &str,
        source: &str,
        lesson_id: Option<&str>,
        amount: i64,
    ) -> Result<bool> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        PointsLedgerDao::new(&conn).append_if_absent(idempotency_key, source, lesson_id, amount)
    }

    pub async fn mark_ledger_synced(&self, keys: &[String]) -> Result<()> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        PointsLedgerDao::new(&conn).mark_synced_by_keys(keys)
    }

    /// 吸收已确认流水：对应变更记录已 synced 的条目标记为已同步
    pub async fn absorb_confirmed_ledger_entries(&self) -> Result<()> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        PointsLedgerDao::new(&conn).mark_confirmed_synced()
    }

    pub async fn ledger_entries(&self) -> Result<Vec<PointsLedgerEntry>> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        PointsLedgerDao::new(&conn).list_all()
    }

    /// 展示总分 = 服务端确认基线 + 未同步流水折叠求和
    pub async fn total_points(&self) -> Result<i64> {
        let baseline = self.points_baseline().await?;
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        let pending = PointsLedgerDao::new(&conn).unsynced_sum()?;
        Ok(baseline + pending)
    }

    // ============================================================
    // 成就
    // ============================================================

    pub async fn unlock_achievement_local(&self, record: &AchievementRecord) -> Result<bool> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        AchievementDao::new(&conn).unlock_local(record)
    }

    pub async fn merge_server_achievement(
        &self,
        achievement_id: &str,
        title: &str,
        description: &str,
        server_unlocked_at: i64,
    ) -> Result<bool> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        AchievementDao::new(&conn).merge_server(achievement_id, title, description, server_unlocked_at)
    }

    pub async fn mark_achievement_synced(&self, achievement_id: &str) -> Result<()> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        AchievementDao::new(&conn).mark_synced(achievement_id)
    }

    pub async fn achievements(&self) -> Result<Vec<AchievementRecord>> {
        let conn = self.sqlite.get_connection().await?;
        let conn = conn.lock().await;
        AchievementDao::new(&conn).list_all()
    }

    // ============================================================
    // 同步元数据（sled）
    // ============================================================

    pub async fn points_baseline(&self) -> Result<i64> {
        Ok(self.kv.get(meta_keys::POINTS_BASELINE).await?.unwrap_or(0))
    }

    pub async fn set_points_baseline(&self, total: i64) -> Result<()> {
        self.kv.set(meta_keys::POINTS_BASELINE, &total).await
    }

    pub async fn streak_days(&self) -> Result<u32> {
        Ok(self.kv.get(meta_keys::STREAK_DAYS).await?.unwrap_or(0))
    }

    pub async fn set_streak_days(&self, days: u32) -> Result<()> {
        self.kv.set(meta_keys::STREAK_DAYS, &days).await
    }

    pub async fn last_sync_at(&self) -> Result<Option<i64>> {
        self.kv.get(meta_keys::LAST_SYNC_AT).await
    }

    pub async fn set_last_sync_at(&self, at_ms: i64) -> Result<()> {
        self.kv.set(meta_keys::LAST_SYNC_AT, &at_ms).await
    }

    pub async fn server_clock_offset_ms(&self) -> Result<i64> {
        Ok(self.kv.get(meta_keys::SERVER_CLOCK_OFFSET).await?.unwrap_or(0))
    }

    pub async fn set_server_clock_offset_ms(&self, offset: i64) -> Result<()> {
        self.kv.set(meta_keys::SERVER_CLOCK_OFFSET, &offset).await
    }

    /// 原子递增实体序号（幂等键 version 输入）
    pub async fn next_sequence(&self, counter_key: &str) -> Result<u64> {
        self.kv.next_sequence(counter_key).await
    }

    /// 显式数据重置 - 唯一会删除进度记录的路径
    pub async fn reset_learner_data(&self) -> Result<()> {
        self.sqlite.reset_learner_data().await?;
        self.dedup.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency;
    use serde_json::json;
    use tempfile::TempDir;

    async fn manager() -> (StorageManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let manager = StorageManager::new(temp_dir.path()).await.unwrap();
        manager.init_learner("learner").await.unwrap();
        manager.switch_learner("learner").await.unwrap();
        (manager, temp_dir)
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_across_calls() {
        let (manager, _dir) = manager().await;
        let key = idempotency::derive_key(EntityType::Progress, "l1", 1);

        for i in 0..5 {
            let record = MutationRecord::new(
                key.clone(),
                EntityType::Progress,
                "l1".to_string(),
                json!({"status": "completed"}),
                1,
            );
            let inserted = manager.enqueue_mutation(&record).await.unwrap();
            assert_eq!(inserted, i == 0);
        }

        assert_eq!(manager.pending_mutation_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_total_points_is_baseline_plus_pending_fold() {
        let (manager, _dir) = manager().await;

        manager.set_points_baseline(100).await.unwrap();
        manager
            .append_ledger_entry("k1", "lesson_completion", Some("l1"), 50)
            .await
            .unwrap();
        manager
            .append_ledger_entry("k2", "streak_bonus", None, 5)
            .await
            .unwrap();

        assert_eq!(manager.total_points().await.unwrap(), 155);

        // 同步确认后基线吸收流水，pending 部分归零
        manager.mark_ledger_synced(&["k1".to_string(), "k2".to_string()]).await.unwrap();
        manager.set_points_baseline(155).await.unwrap();
        assert_eq!(manager.total_points().await.unwrap(), 155);
    }

    #[tokio::test]
    async fn test_reset_clears_entities() {
        let (manager, _dir) = manager().await;

        manager
            .advance_progress("l1", ProgressStatus::Completed, 50, 50, 60_000)
            .await
            .unwrap();
        manager.reset_learner_data().await.unwrap();
        assert!(manager.get_progress("l1").await.unwrap().is_none());
    }
}
