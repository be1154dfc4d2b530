//! 协调引擎 - 把服务端权威状态合并回本地
//!
//! 权威边界按实体类型划分：
//! - 积分总数、连续天数是服务端权威事实，直接作为新基线落地
//! - 课程完成与否是本地权威事实，协调绝不回写进度状态
//! - 成就按 id 合并：服务端元数据获胜，本地解锁时间保留

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::events::{EventBus, SdkEvent};
use crate::storage::StorageManager;
use crate::transport::ReconciliationResult;

pub struct Reconciler {
    storage: Arc<StorageManager>,
    events: EventBus,
}

impl Reconciler {
    pub fn new(storage: Arc<StorageManager>, events: EventBus) -> Self {
        Self { storage, events }
    }

    /// 应用一次服务端响应
    ///
    /// 基线先行：已确认的流水在 drain 阶段就标成 synced，
    /// 此处落下新基线后，展示总分 = 新基线 + 剩余未同步流水。
    pub async fn apply(&self, result: &ReconciliationResult) -> Result<()> {
        self.storage.set_points_baseline(result.total_points).await?;
        self.storage.set_streak_days(result.streak_days).await?;

        for achievement in &result.new_achievements {
            let is_new = self
                .storage
                .merge_server_achievement(
                    &achievement.achievement_id,
                    &achievement.title,
                    &achievement.description,
                    achievement.unlocked_at,
                )
                .await?;
            if is_new {
                // 本地已解锁过的成就不再触发庆祝
                self.events.emit(SdkEvent::AchievementUnlocked {
                    achievement_id: achievement.achievement_id.clone(),
                    title: achievement.title.clone(),
                });
            }
        }

        if let Some(server_time_ms) = result.server_time_ms {
            let offset = server_time_ms - Utc::now().timestamp_millis();
            self.storage.set_server_clock_offset_ms(offset).await?;
            debug!("服务端时钟偏移更新: {}ms", offset);
        }

        let total = self.storage.total_points().await?;
        self.events.emit(SdkEvent::PointsChanged { total_points: total });
        self.events.emit(SdkEvent::StreakUpdated {
            streak_days: result.streak_days,
        });

        info!(
            "✅ 协调完成: 基线={} 连续={}天 新成就={}",
            result.total_points,
            result.streak_days,
            result.new_achievements.len()
        );
        Ok(())
    }
}
