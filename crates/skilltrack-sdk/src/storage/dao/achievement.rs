//! 成就数据访问层
//!
//! 合并规则：服务端记录在元数据上获胜（标题、描述），
//! 但本地 unlocked_at 保留 - 学习者已经看过的庆祝不再重放。

use crate::error::{Result, SkilltrackSDKError};
use crate::storage::entities::{AchievementRecord, SyncState};
use rusqlite::{params, types::Type, Connection, Row};

pub struct AchievementDao<'a> {
    conn: &'a Connection,
}

impl<'a> AchievementDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 本地解锁；同 id 已存在时为无副作用成功
    pub fn unlock_local(&self, record: &AchievementRecord) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT INTO achievements (achievement_id, title, description, unlocked_at, sync_state)
             VALUES (?1, ?2, ?3, ?4, 'pending')
             ON CONFLICT(achievement_id) DO NOTHING",
            params![
                record.achievement_id,
                record.title,
                record.description,
                record.unlocked_at
            ],
        )?;
        Ok(inserted > 0)
    }

    /// 合并一条服务端成就
    ///
    /// 已有本地记录时只覆盖元数据并置为 synced，unlocked_at 不动；
    /// 返回 true 表示这是一条本地从未见过的新成就。
    pub fn merge_server(
        &self,
        achievement_id: &str,
        title: &str,
        description: &str,
        server_unlocked_at: i64,
    ) -> Result<bool> {
        let before: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM achievements WHERE achievement_id = ?1",
            params![achievement_id],
            |row| row.get(0),
        )?;

        self.conn.execute(
            "INSERT INTO achievements (achievement_id, title, description, unlocked_at, sync_state)
             VALUES (?1, ?2, ?3, ?4, 'synced')
             ON CONFLICT(achievement_id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                sync_state = 'synced'",
            params![achievement_id, title, description, server_unlocked_at],
        )?;
        Ok(before == 0)
    }

    pub fn mark_synced(&self, achievement_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE achievements SET sync_state = 'synced' WHERE achievement_id = ?1",
            params![achievement_id],
        )?;
        Ok(())
    }

    pub fn get(&self, achievement_id: &str) -> Result<Option<AchievementRecord>> {
        match self.conn.query_row(
            "SELECT achievement_id, title, description, unlocked_at, sync_state
             FROM achievements WHERE achievement_id = ?1",
            params![achievement_id],
            |row| self.row_to_record(row),
        ) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SkilltrackSDKError::Database(format!("查询成就失败: {}", e))),
        }
    }

    pub fn list_all(&self) -> Result<Vec<AchievementRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT achievement_id, title, description, unlocked_at, sync_state
             FROM achievements ORDER BY unlocked_at ASC",
        )?;
        let rows = stmt.query_map([], |row| self.row_to_record(row))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(
                row.map_err(|e| SkilltrackSDKError::Database(format!("读取成就失败: {}", e)))?,
            );
        }
        Ok(records)
    }

    fn row_to_record(&self, row: &Row<'_>) -> rusqlite::Result<AchievementRecord> {
        let sync_state: String = row.get(4)?;
        Ok(AchievementRecord {
            achievement_id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            unlocked_at: row.get(3)?,
            sync_state: SyncState::from_str(&sync_state).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    Type::Text,
                    format!("未知同步状态: {}", sync_state).into(),
                )
            })?,
        })
    }
}
