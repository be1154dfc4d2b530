//! 积分流水数据访问层
//!
//! 流水是 append-only 的：展示总分 = 服务端确认基线 + 未同步流水求和。
//! 追加时按幂等键去重（唯一索引），这正是防住"重复发分"一类缺陷的机制 -
//! 去重发生在写入时，而不是展示时。

use crate::error::{Result, SkilltrackSDKError};
use crate::storage::entities::{PointsLedgerEntry, SyncState};
use chrono::Utc;
use rusqlite::{params, types::Type, Connection, Row};

pub struct PointsLedgerDao<'a> {
    conn: &'a Connection,
}

impl<'a> PointsLedgerDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 追加一条流水；同幂等键已存在时为无副作用成功
    ///
    /// 返回 true 表示本次真正写入了新条目。
    pub fn append_if_absent(
        &self,
        idempotency_key: &str,
        source: &str,
        lesson_id: Option<&str>,
        amount: i64,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let inserted = self.conn.execute(
            "INSERT INTO points_ledger (idempotency_key, source, lesson_id, amount, sync_state, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![idempotency_key, source, lesson_id, amount, now],
        )?;
        Ok(inserted > 0)
    }

    /// 未同步流水的折叠求和
    pub fn unsynced_sum(&self) -> Result<i64> {
        let sum: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM points_ledger WHERE sync_state = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    /// 按幂等键批量标记为已同步（条目保留，用于审计与历史）
    pub fn mark_synced_by_keys(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "UPDATE points_ledger SET sync_state = 'synced' WHERE idempotency_key IN ({})",
            placeholders
        );
        self.conn
            .execute(&sql, rusqlite::params_from_iter(keys.iter()))?;
        Ok(())
    }

    /// 把已获服务端确认的流水标记为已同步
    ///
    /// 以变更队列里对应键的 synced 状态为准：服务端报告的总分
    /// 基线已覆盖这些条目，再计入 pending 求和就会重复计数。
    pub fn mark_confirmed_synced(&self) -> Result<()> {
        self.conn.execute(
            "UPDATE points_ledger SET sync_state = 'synced'
             WHERE sync_state = 'pending'
               AND idempotency_key IN (
                   SELECT idempotency_key FROM mutation_queue WHERE status = 'synced'
               )",
            [],
        )?;
        Ok(())
    }

    pub fn get_by_key(&self, idempotency_key: &str) -> Result<Option<PointsLedgerEntry>> {
        match self.conn.query_row(
            "SELECT id, idempotency_key, source, lesson_id, amount, sync_state, created_at
             FROM points_ledger WHERE idempotency_key = ?1",
            params![idempotency_key],
            |row| self.row_to_entry(row),
        ) {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SkilltrackSDKError::Database(format!("查询流水失败: {}", e))),
        }
    }

    /// 全部流水（审计用，含已同步条目）
    pub fn list_all(&self) -> Result<Vec<PointsLedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, idempotency_key, source, lesson_id, amount, sync_state, created_at
             FROM points_ledger ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| self.row_to_entry(row))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(
                row.map_err(|e| SkilltrackSDKError::Database(format!("读取流水失败: {}", e)))?,
            );
        }
        Ok(entries)
    }

    fn row_to_entry(&self, row: &Row<'_>) -> rusqlite::Result<PointsLedgerEntry> {
        let sync_state: String = row.get(5)?;
        Ok(PointsLedgerEntry {
            id: row.get(0)?,
            idempotency_key: row.get(1)?,
            source: row.get(2)?,
            lesson_id: row.get(3)?,
            amount: row.get(4)?,
            sync_state: SyncState::from_str(&sync_state).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    Type::Text,
                    format!("未知同步状态: {}", sync_state).into(),
                )
            })?,
            created_at: row.get(6)?,
        })
    }
}
