//! 变更队列数据访问层
//!
//! 功能包括：
//! - 幂等入队（同键冲突时静默成功）
//! - 按优先级 + 创建时间选取批次，尊重实体依赖顺序
//! - 状态流转（in_flight / synced / failed_retryable / failed_terminal）
//! - 统计与诊断查询

use crate::error::{Result, SkilltrackSDKError};
use crate::storage::entities::EntityType;
use crate::storage::queue::{MutationRecord, MutationStatus, QueueStats};
use rusqlite::{params, types::Type, Connection, Row};
use std::collections::HashMap;

const COLUMNS: &str = "id, idempotency_key, entity_type, entity_id, payload, status, \
     attempts, last_attempt_at, last_error, priority, created_at, scheduled_not_before, depends_on";

/// 变更队列数据访问对象
pub struct MutationQueueDao<'a> {
    conn: &'a Connection,
}

impl<'a> MutationQueueDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 幂等入队
    ///
    /// 同一幂等键已存在时（无论什么状态）本次调用是无副作用的成功，
    /// 返回 false 表示记录已存在。依赖唯一索引在单条语句内完成
    /// 查重与写入，避免先读后写的竞态。
    pub fn insert_if_absent(&self, record: &MutationRecord) -> Result<bool> {
        let payload = record.payload.to_string();
        let inserted = self.conn.execute(
            "INSERT INTO mutation_queue (
                id, idempotency_key, entity_type, entity_id, payload, status,
                attempts, last_attempt_at, last_error, priority, created_at,
                scheduled_not_before, depends_on
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                record.id,
                record.idempotency_key,
                record.entity_type.as_str(),
                record.entity_id,
                payload,
                record.status.as_str(),
                record.attempts,
                record.last_attempt_at,
                record.last_error,
                record.priority,
                record.created_at,
                record.scheduled_not_before,
                record.depends_on,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// 根据幂等键查询记录
    pub fn get_by_key(&self, idempotency_key: &str) -> Result<Option<MutationRecord>> {
        let sql = format!(
            "SELECT {} FROM mutation_queue WHERE idempotency_key = ?1",
            COLUMNS
        );
        match self
            .conn
            .query_row(&sql, params![idempotency_key], |row| self.row_to_record(row))
        {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SkilltrackSDKError::Database(format!("查询变更记录失败: {}", e))),
        }
    }

    /// 选取下一批待同步记录
    ///
    /// 排序为 (priority asc, created_at asc)，并施加两道闸门：
    /// - 退避闸门：scheduled_not_before <= now
    /// - 依赖闸门：depends_on 指向的前置记录尚未 synced 时跳过本记录
    ///   （积分变更不会先于它引用的进度完成变更被选中；前置死信时
    ///   本记录同样不放行，由调度器级联转入死信）
    ///
    /// 字节上限在取出后截断，至少保留一条避免饿死大记录。
    pub fn peek_batch(
        &self,
        max_items: usize,
        max_bytes: usize,
        now_ms: i64,
    ) -> Result<Vec<MutationRecord>> {
        let sql = format!(
            "SELECT {} FROM mutation_queue m
             WHERE m.status IN ('pending', 'failed_retryable')
               AND m.scheduled_not_before <= ?1
               AND (m.depends_on IS NULL OR NOT EXISTS (
                    SELECT 1 FROM mutation_queue d
                    WHERE d.idempotency_key = m.depends_on
                      AND d.status != 'synced'
               ))
             ORDER BY m.priority ASC, m.created_at ASC
             LIMIT ?2",
            COLUMNS
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now_ms, max_items as i64], |row| {
            self.row_to_record(row)
        })?;

        let mut batch = Vec::new();
        let mut bytes = 0usize;
        for row in rows {
            let record =
                row.map_err(|e| SkilltrackSDKError::Database(format!("读取变更记录失败: {}", e)))?;
            let size = record.estimated_size();
            if !batch.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            batch.push(record);
        }
        Ok(batch)
    }

    /// 批量标记为在途，并累加尝试次数
    pub fn mark_in_flight(&self, ids: &[String], now_ms: i64) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "UPDATE mutation_queue
             SET status = 'in_flight', attempts = attempts + 1, last_attempt_at = ?1
             WHERE id IN ({})",
            placeholders.join(", ")
        );
        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(ids.len() + 1);
        values.push(&now_ms);
        for id in ids {
            values.push(id);
        }
        self.conn.execute(&sql, &values[..])?;
        Ok(())
    }

    /// 按幂等键批量标记为已同步
    pub fn mark_synced_by_keys(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "UPDATE mutation_queue SET status = 'synced', last_error = NULL
             WHERE idempotency_key IN ({})",
            placeholders
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(keys.iter()))?;
        Ok(())
    }

    /// 标记为可重试失败，并设置退避闸门
    pub fn mark_failed_retryable(&self, id: &str, error: &str, not_before: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE mutation_queue
             SET status = 'failed_retryable', last_error = ?2, scheduled_not_before = ?3
             WHERE id = ?1",
            params![id, error, not_before],
        )?;
        Ok(())
    }

    /// 标记为终态失败（保留用于诊断，不再进入批次）
    pub fn mark_failed_terminal(&self, id: &str, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE mutation_queue SET status = 'failed_terminal', last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    /// 最早的重试闸门时刻
    ///
    /// 只看 failed_retryable：pending 记录的闸门在创建时刻、
    /// 永远已放行，不构成"下次有事可做"的等待点。
    pub fn next_retry_due_at(&self) -> Result<Option<i64>> {
        let due: Option<i64> = self.conn.query_row(
            "SELECT MIN(scheduled_not_before) FROM mutation_queue
             WHERE status = 'failed_retryable'",
            [],
            |row| row.get(0),
        )?;
        Ok(due)
    }

    /// 依赖指定幂等键且自身未到终态的记录
    pub fn non_terminal_dependents_of(&self, idempotency_key: &str) -> Result<Vec<MutationRecord>> {
        let sql = format!(
            "SELECT {} FROM mutation_queue
             WHERE depends_on = ?1
               AND status IN ('pending', 'in_flight', 'failed_retryable')",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![idempotency_key], |row| self.row_to_record(row))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(
                row.map_err(|e| SkilltrackSDKError::Database(format!("读取依赖记录失败: {}", e)))?,
            );
        }
        Ok(records)
    }

    /// 仍未到达终态的记录数（pending + in_flight + failed_retryable）
    pub fn outstanding_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM mutation_queue
             WHERE status IN ('pending', 'in_flight', 'failed_retryable')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// 终态失败的记录数（UI 聚合为 N 项需要关注）
    pub fn dead_letter_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM mutation_queue WHERE status = 'failed_terminal'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// 队列统计
    pub fn stats(&self) -> Result<QueueStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM mutation_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts: HashMap<MutationStatus, usize> = HashMap::new();
        for row in rows {
            let (status, count) =
                row.map_err(|e| SkilltrackSDKError::Database(format!("读取统计失败: {}", e)))?;
            if let Some(status) = MutationStatus::from_str(&status) {
                counts.insert(status, count as usize);
            }
        }
        Ok(QueueStats::from_status_counts(&counts))
    }

    fn row_to_record(&self, row: &Row<'_>) -> rusqlite::Result<MutationRecord> {
        let entity_type: String = row.get(2)?;
        let payload: String = row.get(4)?;
        let status: String = row.get(5)?;

        Ok(MutationRecord {
            id: row.get(0)?,
            idempotency_key: row.get(1)?,
            entity_type: EntityType::from_str(&entity_type).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    Type::Text,
                    format!("未知实体类型: {}", entity_type).into(),
                )
            })?,
            entity_id: row.get(3)?,
            payload: serde_json::from_str(&payload).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
            })?,
            status: MutationStatus::from_str(&status).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    Type::Text,
                    format!("未知记录状态: {}", status).into(),
                )
            })?,
            attempts: row.get(6)?,
            last_attempt_at: row.get(7)?,
            last_error: row.get(8)?,
            priority: row.get(9)?,
            created_at: row.get(10)?,
            scheduled_not_before: row.get(11)?,
            depends_on: row.get(12)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE mutation_queue (
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
        .unwrap();
        conn
    }

    fn record(key: &str, entity_type: EntityType, entity_id: &str) -> MutationRecord {
        MutationRecord::new(
            key.to_string(),
            entity_type,
            entity_id.to_string(),
            json!({"k": key}),
            10,
        )
    }

    #[test]
    fn test_idempotent_enqueue_collapses_duplicates() {
        let conn = test_conn();
        let dao = MutationQueueDao::new(&conn);

        let first = record("key-a", EntityType::Progress, "lesson-1");
        assert!(dao.insert_if_absent(&first).unwrap());

        // 相同逻辑变更重复入队：同键、不同记录 id
        for _ in 0..5 {
            let dup = record("key-a", EntityType::Progress, "lesson-1");
            assert!(!dao.insert_if_absent(&dup).unwrap());
        }

        let stats = dao.stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn test_peek_batch_respects_dependency_order() {
        let conn = test_conn();
        let dao = MutationQueueDao::new(&conn);
        let now = chrono::Utc::now().timestamp_millis();

        let progress = record("progress-key", EntityType::Progress, "lesson-1");
        let points = record("points-key", EntityType::Points, "lesson-1")
            .with_depends_on("progress-key".to_string());
        dao.insert_if_absent(&progress).unwrap();
        dao.insert_if_absent(&points).unwrap();

        // 进度未确认时，积分变更不得进入批次
        let batch = dao.peek_batch(10, 1 << 20, now).unwrap();
        let keys: Vec<_> = batch.iter().map(|r| r.idempotency_key.as_str()).collect();
        assert!(keys.contains(&"progress-key"));
        assert!(!keys.contains(&"points-key"));

        // 进度确认后，积分变更放行
        dao.mark_synced_by_keys(&["progress-key".to_string()]).unwrap();
        let batch = dao.peek_batch(10, 1 << 20, now).unwrap();
        let keys: Vec<_> = batch.iter().map(|r| r.idempotency_key.as_str()).collect();
        assert_eq!(keys, vec!["points-key"]);
    }

    #[test]
    fn test_peek_batch_excludes_gated_and_terminal() {
        let conn = test_conn();
        let dao = MutationQueueDao::new(&conn);
        let now = chrono::Utc::now().timestamp_millis();

        let due = record("due", EntityType::Progress, "l1");
        let mut gated = record("gated", EntityType::Progress, "l2");
        gated.scheduled_not_before = now + 60_000;
        let dead = record("dead", EntityType::Progress, "l3");

        dao.insert_if_absent(&due).unwrap();
        dao.insert_if_absent(&gated).unwrap();
        dao.insert_if_absent(&dead).unwrap();
        dao.mark_failed_terminal(&dead.id, "malformed").unwrap();

        let batch = dao.peek_batch(10, 1 << 20, now).unwrap();
        let keys: Vec<_> = batch.iter().map(|r| r.idempotency_key.as_str()).collect();
        assert_eq!(keys, vec!["due"]);

        // 退避闸门放行后可再次选中
        let batch = dao.peek_batch(10, 1 << 20, now + 120_000).unwrap();
        let keys: Vec<_> = batch.iter().map(|r| r.idempotency_key.as_str()).collect();
        assert_eq!(keys, vec!["due", "gated"]);
    }

    #[test]
    fn test_terminal_dependency_keeps_dependent_blocked() {
        let conn = test_conn();
        let dao = MutationQueueDao::new(&conn);
        let now = chrono::Utc::now().timestamp_millis();

        let progress = record("progress-key", EntityType::Progress, "lesson-1");
        let points = record("points-key", EntityType::Points, "lesson-1")
            .with_depends_on("progress-key".to_string());
        dao.insert_if_absent(&progress).unwrap();
        dao.insert_if_absent(&points).unwrap();
        dao.mark_failed_terminal(&progress.id, "rejected").unwrap();

        // 前置死信后，依赖它的记录不放行
        let batch = dao.peek_batch(10, 1 << 20, now).unwrap();
        assert!(batch.is_empty());

        let dependents = dao.non_terminal_dependents_of("progress-key").unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].idempotency_key, "points-key");
    }

    #[test]
    fn test_peek_batch_priority_then_created_at() {
        let conn = test_conn();
        let dao = MutationQueueDao::new(&conn);
        let now = chrono::Utc::now().timestamp_millis();

        let mut low = record("low", EntityType::Session, "s1");
        low.priority = 20;
        low.created_at = now - 10_000;
        let mut high = record("high", EntityType::Progress, "l1");
        high.priority = 1;
        high.created_at = now;

        dao.insert_if_absent(&low).unwrap();
        dao.insert_if_absent(&high).unwrap();

        let batch = dao.peek_batch(10, 1 << 20, now).unwrap();
        let keys: Vec<_> = batch.iter().map(|r| r.idempotency_key.as_str()).collect();
        assert_eq!(keys, vec!["high", "low"]);
    }

    #[test]
    fn test_mark_in_flight_increments_attempts() {
        let conn = test_conn();
        let dao = MutationQueueDao::new(&conn);
        let now = chrono::Utc::now().timestamp_millis();

        let r = record("key", EntityType::Progress, "l1");
        dao.insert_if_absent(&r).unwrap();

        dao.mark_in_flight(&[r.id.clone()], now).unwrap();
        dao.mark_failed_retryable(&r.id, "timeout", now + 1_000).unwrap();
        dao.mark_in_flight(&[r.id.clone()], now + 2_000).unwrap();

        let stored = dao.get_by_key("key").unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.status, MutationStatus::InFlight);
    }

    #[test]
    fn test_byte_budget_keeps_at_least_one() {
        let conn = test_conn();
        let dao = MutationQueueDao::new(&conn);
        let now = chrono::Utc::now().timestamp_millis();

        dao.insert_if_absent(&record("a", EntityType::Progress, "l1")).unwrap();
        dao.insert_if_absent(&record("b", EntityType::Progress, "l2")).unwrap();

        // 预算小于单条记录大小，仍返回一条
        let batch = dao.peek_batch(10, 1, now).unwrap();
        assert_eq!(batch.len(), 1);
    }
}
