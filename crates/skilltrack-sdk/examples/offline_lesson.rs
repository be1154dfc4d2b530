//! 离线学习 -> 网络恢复 -> 同步协调 的端到端演示
//!
//! 运行: cargo run --example offline_lesson

use async_trait::async_trait;
use skilltrack_sdk::{
    EntityType, LocalContentRegistry, LoggingReporter, MutationOutcome, MutationRecord,
    NetworkState, ReconciliationResult, Result, SdkConfig, SkilltrackSDK, SyncBatchResult,
    TransportClient,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// 演示用内存服务端：兑现幂等键契约
struct DemoServer {
    applied: Mutex<HashSet<String>>,
    total_points: Mutex<i64>,
}

#[async_trait]
impl TransportClient for DemoServer {
    async fn send_batch(&self, batch: &[MutationRecord]) -> Result<SyncBatchResult> {
        let mut applied = self.applied.lock().unwrap();
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

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("skilltrack_sdk=debug,offline_lesson=info")
        .init();

    let data_dir = tempfile::tempdir()?;
    let content = Arc::new(LocalContentRegistry::new());
    let server = Arc::new(DemoServer {
        applied: Mutex::new(HashSet::new()),
        total_points: Mutex::new(0),
    });

    let sdk = SkilltrackSDK::new(
        SdkConfig::new(data_dir.path()),
        server,
        content.clone(),
        Arc::new(LoggingReporter),
    )
    .await?;
    sdk.sign_in("demo-learner").await?;

    // 离线学习一节课
    content.mark_available("lesson-1").await;
    sdk.start_lesson("lesson-1").await?;
    for i in 1..=5 {
        sdk.submit_answer("lesson-1", &format!("q{}", i), true, 10).await?;
    }
    let completion = sdk.complete_lesson("lesson-1", 50, 90_000, Some(300_000)).await?;
    println!(
        "离线完成: +{} 分, 本地总分 {}",
        completion.points_awarded,
        sdk.total_points().await?
    );
    println!("待同步变更: {}", sdk.sync_status().await?.pending_count);

    // 网络恢复，同步并等待结束
    sdk.set_network_state(NetworkState::Online);
    sdk.sync_now().await;

    let status = sdk.sync_status().await?;
    println!(
        "同步后: 总分 {}, 待同步 {}, 死信 {}",
        status.total_points, status.pending_count, status.dead_letter_count
    );

    sdk.shutdown();
    Ok(())
}
