//! 进度数据访问层
//!
//! 课程完成与否是本地权威事实：同步只会把 sync_state 翻成 synced，
//! 绝不回写状态本身。状态只能单调前进，作答同题为替换。

use crate::error::{Result, SkilltrackSDKError};
use crate::storage::entities::{AnswerRecord, ProgressRecord, ProgressStatus, SyncState};
use chrono::Utc;
use rusqlite::{params, types::Type, Connection, Row};

pub struct ProgressDao<'a> {
    conn: &'a Connection,
}

impl<'a> ProgressDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 单调推进课程状态
    ///
    /// 整个读改写在一个事务里完成。状态只升不降；每次实际发生的
    /// 状态迁移使 transitions 加一（幂等键 version 的来源）。
    /// 返回更新后的记录。
    pub fn advance_status(
        &self,
        learner_id: &str,
        lesson_id: &str,
        target: ProgressStatus,
        score: i64,
        max_score: i64,
        time_spent_ms: i64,
    ) -> Result<ProgressRecord> {
        let now = Utc::now().timestamp_millis();
        let tx = self.conn.unchecked_transaction()?;

        let existing = match tx.query_row(
            "SELECT status, transitions FROM progress WHERE learner_id = ?1 AND lesson_id = ?2",
            params![learner_id, lesson_id],
            |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            },
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(SkilltrackSDKError::Database(format!("查询进度失败: {}", e))),
        };

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO progress (
                        learner_id, lesson_id, status, score, max_score, time_spent_ms,
                        transitions, sync_state, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 'pending', ?7, ?7)",
                    params![learner_id, lesson_id, target.as_str(), score, max_score, time_spent_ms, now],
                )?;
            }
            Some((current, transitions)) => {
                let current = ProgressStatus::from_str(&current).ok_or_else(|| {
                    SkilltrackSDKError::Database(format!("未知进度状态: {}", current))
                })?;
                if target.rank() > current.rank() {
                    tx.execute(
                        "UPDATE progress SET status = ?3, score = MAX(score, ?4),
                            max_score = MAX(max_score, ?5), time_spent_ms = time_spent_ms + ?6,
                            transitions = ?7, sync_state = 'pending', updated_at = ?8
                         WHERE learner_id = ?1 AND lesson_id = ?2",
                        params![
                            learner_id,
                            lesson_id,
                            target.as_str(),
                            score,
                            max_score,
                            time_spent_ms,
                            transitions + 1,
                            now
                        ],
                    )?;
                } else {
                    // 状态不回退；分数仍可提升
                    tx.execute(
                        "UPDATE progress SET score = MAX(score, ?3),
                            max_score = MAX(max_score, ?4), time_spent_ms = time_spent_ms + ?5,
                            updated_at = ?6
                         WHERE learner_id = ?1 AND lesson_id = ?2",
                        params![learner_id, lesson_id, score, max_score, time_spent_ms, now],
                    )?;
                }
            }
        }

        tx.commit()?;
        self.get(learner_id, lesson_id)?.ok_or_else(|| {
            SkilltrackSDKError::Database("进度记录写入后不可见".to_string())
        })
    }

    /// 记录一次作答（同题重答为替换，不追加）
    pub fn record_answer(&self, answer: &AnswerRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO answers (lesson_id, question_id, correct, score, answered_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(lesson_id, question_id) DO UPDATE SET
                correct = excluded.correct,
                score = excluded.score,
                answered_at = excluded.answered_at",
            params![
                answer.lesson_id,
                answer.question_id,
                answer.correct,
                answer.score,
                answer.answered_at
            ],
        )?;
        Ok(())
    }

    /// 某课程的全部作答
    pub fn answers_for_lesson(&self, lesson_id: &str) -> Result<Vec<AnswerRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT lesson_id, question_id, correct, score, answered_at
             FROM answers WHERE lesson_id = ?1 ORDER BY answered_at ASC",
        )?;
        let rows = stmt.query_map(params![lesson_id], |row| {
            Ok(AnswerRecord {
                lesson_id: row.get(0)?,
                question_id: row.get(1)?,
                correct: row.get(2)?,
                score: row.get(3)?,
                answered_at: row.get(4)?,
            })
        })?;

        let mut answers = Vec::new();
        for row in rows {
            answers.push(row.map_err(|e| {
                SkilltrackSDKError::Database(format!("读取作答记录失败: {}", e))
            })?);
        }
        Ok(answers)
    }

    pub fn get(&self, learner_id: &str, lesson_id: &str) -> Result<Option<ProgressRecord>> {
        match self.conn.query_row(
            "SELECT learner_id, lesson_id, status, score, max_score, time_spent_ms,
                    transitions, sync_state, created_at, updated_at
             FROM progress WHERE learner_id = ?1 AND lesson_id = ?2",
            params![learner_id, lesson_id],
            |row| self.row_to_record(row),
        ) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SkilltrackSDKError::Database(format!("查询进度失败: {}", e))),
        }
    }

    /// 同步确认后翻转 sync_state，不触碰其余字段
    pub fn mark_synced(&self, learner_id: &str, lesson_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE progress SET sync_state = 'synced'
             WHERE learner_id = ?1 AND lesson_id = ?2",
            params![learner_id, lesson_id],
        )?;
        Ok(())
    }

    fn row_to_record(&self, row: &Row<'_>) -> rusqlite::Result<ProgressRecord> {
        let status: String = row.get(2)?;
        let sync_state: String = row.get(7)?;
        Ok(ProgressRecord {
            learner_id: row.get(0)?,
            lesson_id: row.get(1)?,
            status: ProgressStatus::from_str(&status).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    Type::Text,
                    format!("未知进度状态: {}", status).into(),
                )
            })?,
            score: row.get(3)?,
            max_score: row.get(4)?,
            time_spent_ms: row.get(5)?,
            transitions: row.get(6)?,
            sync_state: SyncState::from_str(&sync_state).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    Type::Text,
                    format!("未知同步状态: {}", sync_state).into(),
                )
            })?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE progress (
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
            );
            CREATE TABLE answers (
                lesson_id TEXT NOT NULL,
                question_id TEXT NOT NULL,
                correct INTEGER NOT NULL,
                score INTEGER NOT NULL DEFAULT 0,
                answered_at INTEGER NOT NULL,
                PRIMARY KEY (lesson_id, question_id)
            );",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_status_advances_and_counts_transitions() {
        let conn = test_conn();
        let dao = ProgressDao::new(&conn);

        let started = dao
            .advance_status("u1", "l1", ProgressStatus::InProgress, 0, 0, 0)
            .unwrap();
        assert_eq!(started.status, ProgressStatus::InProgress);
        assert_eq!(started.transitions, 1);

        let completed = dao
            .advance_status("u1", "l1", ProgressStatus::Completed, 40, 50, 90_000)
            .unwrap();
        assert_eq!(completed.status, ProgressStatus::Completed);
        assert_eq!(completed.transitions, 2);
    }

    #[test]
    fn test_status_never_regresses() {
        let conn = test_conn();
        let dao = ProgressDao::new(&conn);

        dao.advance_status("u1", "l1", ProgressStatus::Completed, 50, 50, 60_000)
            .unwrap();
        let after = dao
            .advance_status("u1", "l1", ProgressStatus::InProgress, 10, 50, 5_000)
            .unwrap();

        assert_eq!(after.status, ProgressStatus::Completed);
        // 回退尝试不计入状态迁移
        assert_eq!(after.transitions, 1);
        // 分数保留历史最高
        assert_eq!(after.score, 50);
    }

    #[test]
    fn test_reanswer_replaces_not_appends() {
        let conn = test_conn();
        let dao = ProgressDao::new(&conn);

        let first = AnswerRecord {
            lesson_id: "l1".to_string(),
            question_id: "q1".to_string(),
            correct: false,
            score: 0,
            answered_at: 100,
        };
        let retry = AnswerRecord {
            correct: true,
            score: 10,
            answered_at: 200,
            ..first.clone()
        };

        dao.record_answer(&first).unwrap();
        dao.record_answer(&retry).unwrap();

        let answers = dao.answers_for_lesson("l1").unwrap();
        assert_eq!(answers.len(), 1);
        assert!(answers[0].correct);
        assert_eq!(answers[0].score, 10);
    }

    #[test]
    fn test_mark_synced_only_flips_sync_state() {
        let conn = test_conn();
        let dao = ProgressDao::new(&conn);

        dao.advance_status("u1", "l1", ProgressStatus::Completed, 50, 50, 60_000)
            .unwrap();
        dao.mark_synced("u1", "l1").unwrap();

        let record = dao.get("u1", "l1").unwrap().unwrap();
        assert_eq!(record.sync_state, SyncState::Synced);
        assert_eq!(record.status, ProgressStatus::Completed);
        assert_eq!(record.score, 50);
    }
}
