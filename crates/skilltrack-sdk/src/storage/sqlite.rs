//! SQLite 存储模块 - 实体表与变更队列的持久化
//!
//! 本模块提供：
//! - 按学习者隔离的数据库（users/{learner_id}/progress.db）
//! - WAL 模式与性能 pragma
//! - 进度、积分流水、成就、变更队列各表的建表与索引

use crate::error::{Result, SkilltrackSDKError};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// SQLite 存储组件
#[derive(Debug)]
pub struct SqliteStore {
    base_path: PathBuf,
    /// 学习者数据库连接池
    learner_connections: Arc<RwLock<HashMap<String, Arc<Mutex<Connection>>>>>,
    /// 当前学习者ID
    current_learner: Arc<RwLock<Option<String>>>,
}

impl SqliteStore {
    pub async fn new(base_path: &Path) -> Result<Self> {
        Ok(Self {
            base_path: base_path.to_path_buf(),
            learner_connections: Arc::new(RwLock::new(HashMap::new())),
            current_learner: Arc::new(RwLock::new(None)),
        })
    }

    /// 初始化学习者数据库
    pub async fn init_learner_database(&self, learner_id: &str) -> Result<()> {
        let learner_dir = self.base_path.join("users").join(learner_id);
        tokio::fs::create_dir_all(&learner_dir)
            .await
            .map_err(|e| SkilltrackSDKError::IO(format!("创建学习者数据目录失败: {}", e)))?;

        let db_path = learner_dir.join("progress.db");
        let conn = Connection::open(&db_path)
            .map_err(|e| SkilltrackSDKError::Database(format!("打开数据库失败: {}", e)))?;

        // 启用 WAL 模式和其他优化
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| SkilltrackSDKError::Database(format!("设置 WAL 模式失败: {}", e)))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| SkilltrackSDKError::Database(format!("设置同步模式失败: {}", e)))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| SkilltrackSDKError::Database(format!("启用外键失败: {}", e)))?;

        self.create_database_tables(&conn)?;

        let mut connections = self.learner_connections.write().await;
        connections.insert(learner_id.to_string(), Arc::new(Mutex::new(conn)));

        tracing::info!("学习者数据库初始化完成: {}", learner_id);
        Ok(())
    }

    /// 切换学习者
    pub async fn switch_learner(&self, learner_id: &str) -> Result<()> {
        let connections = self.learner_connections.read().await;
        if !connections.contains_key(learner_id) {
            drop(connections);
            self.init_learner_database(learner_id).await?;
        }

        let mut current = self.current_learner.write().await;
        *current = Some(learner_id.to_string());
        Ok(())
    }

    /// 获取当前学习者ID
    pub async fn current_learner(&self) -> Result<String> {
        self.current_learner
            .read()
            .await
            .clone()
            .ok_or_else(|| SkilltrackSDKError::NotInitialized("未选择学习者".to_string()))
    }

    /// 获取当前学习者的数据库连接
    pub async fn get_connection(&self) -> Result<Arc<Mutex<Connection>>> {
        let current = self.current_learner.read().await;
        let learner_id = current
            .as_ref()
            .ok_or_else(|| SkilltrackSDKError::NotInitialized("未选择学习者".to_string()))?;

        let connections = self.learner_connections.read().await;
        let conn = connections
            .get(learner_id)
            .ok_or_else(|| SkilltrackSDKError::Database("学习者数据库连接不存在".to_string()))?;
        Ok(conn.clone())
    }

    /// 释放学习者连接
    pub async fn cleanup_learner(&self, learner_id: &str) -> Result<()> {
        let mut connections = self.learner_connections.write().await;
        connections.remove(learner_id);
        Ok(())
    }

    /// 清空学习者的全部本地数据（唯一会删除进度记录的路径）
    pub async fn reset_learner_data(&self) -> Result<()> {
        let conn_mutex = self.get_connection().await?;
        let conn = conn_mutex.lock().await;

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| SkilltrackSDKError::Database(format!("开启事务失败: {}", e)))?;
        for table in ["mutation_queue", "answers", "progress", "points_ledger", "achievements"] {
            tx.execute(&format!("DELETE FROM {}", table), [])
                .map_err(|e| SkilltrackSDKError::Database(format!("清空 {} 失败: {}", table, e)))?;
        }
        tx.commit()
            .map_err(|e| SkilltrackSDKError::Database(format!("提交事务失败: {}", e)))?;

        tracing::warn!("🧹 学习者本地数据已重置");
        Ok(())
    }

    /// 创建数据库表
    fn create_database_tables(&self, conn: &Connection) -> Result<()> {
        // 变更队列表，idempotency_key 唯一索引是本地去重的根基
        conn.execute(
            "CREATE TABLE IF NOT EXISTS mutation_queue (
                id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                last_error TEXT,
                priority INTEGER NOT NULL DEFAULT 10,
                created_at INTEGER NOT NULL,
                scheduled_not_before INTEGER NOT NULL,
                depends_on TEXT
            )",
            [],
        )
        .map_err(|e| SkilltrackSDKError::Database(format!("创建变更队列表失败: {}", e)))?;

        // 进度表，(learner_id, lesson_id) 主键
        conn.execute(
            "CREATE TABLE IF NOT EXISTS progress (
                learner_id TEXT NOT NULL,
                lesson_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'not_started',
                score INTEGER NOT NULL DEFAULT 0,
                max_score INTEGER NOT NULL DEFAULT 0,
                time_spent_ms INTEGER NOT NULL DEFAULT 0,
                transitions INTEGER NOT NULL DEFAULT 0,
                sync_state TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (learner_id, lesson_id)
            )",
            [],
        )
        .map_err(|e| SkilltrackSDKError::Database(format!("创建进度表失败: {}", e)))?;

        // 作答表，同题重答为替换
        conn.execute(
            "CREATE TABLE IF NOT EXISTS answers (
                lesson_id TEXT NOT NULL,
                question_id TEXT NOT NULL,
                correct INTEGER NOT NULL,
                score INTEGER NOT NULL DEFAULT 0,
                answered_at INTEGER NOT NULL,
                PRIMARY KEY (lesson_id, question_id)
            )",
            [],
        )
        .map_err(|e| SkilltrackSDKError::Database(format!("创建作答表失败: {}", e)))?;

        // 积分流水表，append-only，幂等键唯一
        conn.execute(
            "CREATE TABLE IF NOT EXISTS points_ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                idempotency_key TEXT NOT NULL UNIQUE,
                source TEXT NOT NULL,
                lesson_id TEXT,
                amount INTEGER NOT NULL,
                sync_state TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| SkilltrackSDKError::Database(format!("创建积分流水表失败: {}", e)))?;

        // 成就表
        conn.execute(
            "CREATE TABLE IF NOT EXISTS achievements (
                achievement_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                unlocked_at INTEGER NOT NULL,
                sync_state TEXT NOT NULL DEFAULT 'pending'
            )",
            [],
        )
        .map_err(|e| SkilltrackSDKError::Database(format!("创建成就表失败: {}", e)))?;

        // 索引
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_queue_status ON mutation_queue(status)",
            [],
        )
        .map_err(|e| SkilltrackSDKError::Database(format!("创建队列状态索引失败: {}", e)))?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_queue_gate ON mutation_queue(scheduled_not_before)",
            [],
        )
        .map_err(|e| SkilltrackSDKError::Database(format!("创建退避闸门索引失败: {}", e)))?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ledger_sync ON points_ledger(sync_state)",
            [],
        )
        .map_err(|e| SkilltrackSDKError::Database(format!("创建流水同步索引失败: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_store_init() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::new(temp_dir.path()).await.unwrap();

        store.init_learner_database("learner_1").await.unwrap();
        store.switch_learner("learner_1").await.unwrap();

        let conn = store.get_connection().await.unwrap();
        let conn_guard = conn.lock().await;
        for table in ["mutation_queue", "progress", "answers", "points_ledger", "achievements"] {
            let exists: bool = conn_guard
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "table {} missing", table);
        }
    }

    #[tokio::test]
    async fn test_switch_initializes_missing_learner() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::new(temp_dir.path()).await.unwrap();

        store.switch_learner("learner_2").await.unwrap();
        assert_eq!(store.current_learner().await.unwrap(), "learner_2");
        assert!(store.get_connection().await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_learner_data_empties_tables() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::new(temp_dir.path()).await.unwrap();
        store.switch_learner("learner_3").await.unwrap();

        {
            let conn = store.get_connection().await.unwrap();
            let conn = conn.lock().await;
            conn.execute(
                "INSERT INTO points_ledger (idempotency_key, source, amount, created_at)
                 VALUES ('k1', 'test', 10, 0)",
                [],
            )
            .unwrap();
        }

        store.reset_learner_data().await.unwrap();

        let conn = store.get_connection().await.unwrap();
        let conn = conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM points_ledger", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
