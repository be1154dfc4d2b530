//! 同步调度器 - 变更队列的唯一排空者
//!
//! 状态机：Idle -> Checking -> Draining -> Reconciling -> Idle，
//! 可恢复失败进入 Backoff。正确性依赖两条纪律：
//! - 任一时刻最多一个排空运行在进行（run_lock 单写者保证）；
//!   运行期间的新触发合并为"结束后再跑一次"，绝不并发排空
//! - 每个同步结果都是显式分类（acked / duplicate / rejected /
//!   可重试 / 终态），不从异常里猜

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{EventBus, SdkEvent};
use crate::network::{NetworkMonitor, NetworkState};
use crate::reporting::DeadLetterReporter;
use crate::storage::entities::EntityType;
use crate::storage::queue::{MutationRecord, RetryDecision, RetryManager, SyncFailureReason};
use crate::storage::StorageManager;
use crate::sync::{Reconciler, SchedulerState, SyncConfig, SyncStatusSnapshot};
use crate::transport::{MutationOutcome, SyncBatchResult, TransportClient};

pub struct SyncScheduler {
    storage: Arc<StorageManager>,
    transport: Arc<dyn TransportClient>,
    network: NetworkMonitor,
    events: EventBus,
    reporter: Arc<dyn DeadLetterReporter>,
    reconciler: Reconciler,
    config: SyncConfig,
    retry: RetryManager,
    state: Arc<RwLock<SchedulerState>>,
    /// 单写者保证：排空运行互斥
    run_lock: Arc<Mutex<()>>,
    /// 运行中收到的触发合并到这里
    rerun_requested: Arc<AtomicBool>,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl SyncScheduler {
    pub fn new(
        storage: Arc<StorageManager>,
        transport: Arc<dyn TransportClient>,
        network: NetworkMonitor,
        events: EventBus,
        reporter: Arc<dyn DeadLetterReporter>,
        config: SyncConfig,
    ) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&storage), events.clone());
        let retry = RetryManager::new(config.retry_policy.clone());
        Self {
            storage,
            transport,
            network,
            events,
            reporter,
            reconciler,
            config,
            retry,
            state: Arc::new(RwLock::new(SchedulerState::Idle)),
            run_lock: Arc::new(Mutex::new(())),
            rerun_requested: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    async fn set_state(&self, next: SchedulerState) {
        let mut state = self.state.write().await;
        if *state != next {
            debug!("调度器状态: {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// 对 UI 层的只读快照
    pub async fn status(&self) -> Result<SyncStatusSnapshot> {
        Ok(SyncStatusSnapshot {
            state: self.state().await,
            pending_count: self.storage.pending_mutation_count().await?,
            dead_letter_count: self.storage.dead_letter_count().await?,
            last_sync_at: self.storage.last_sync_at().await?,
            total_points: self.storage.total_points().await?,
        })
    }

    /// 强制同步请求
    ///
    /// 空闲时立即唤醒后台循环；Backoff 等待中会取消剩余延迟；
    /// 排空进行中则合并为"结束后再跑一次"。
    pub fn trigger_sync(&self) {
        self.wake.notify_one();
    }

    /// 启动后台循环
    ///
    /// 唤醒来源：强制同步、网络恢复、周期定时器。
    pub fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut network_rx = scheduler.network.subscribe();
            let mut ticker = tokio::time::interval(scheduler.config.periodic_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval 的首个 tick 立即返回，吞掉它避免启动即同步
            ticker.tick().await;

            info!("🔄 同步调度器已启动");
            loop {
                tokio::select! {
                    _ = scheduler.shutdown.notified() => break,
                    _ = scheduler.wake.notified() => {}
                    _ = ticker.tick() => {}
                    changed = network_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *network_rx.borrow() != NetworkState::Online {
                            continue;
                        }
                    }
                }

                scheduler.run().await;

                // 可恢复失败后的退避等待：到点自动重入，
                // 强制同步可取消剩余延迟，排空中途不可打断
                while let SchedulerState::Backoff { until_ms } = scheduler.state().await {
                    let now = Utc::now().timestamp_millis();
                    if until_ms > now {
                        let delay = std::time::Duration::from_millis((until_ms - now) as u64);
                        tokio::select! {
                            _ = scheduler.shutdown.notified() => return,
                            _ = tokio::time::sleep(delay) => {}
                            _ = scheduler.wake.notified() => {
                                debug!("强制同步取消剩余退避");
                            }
                        }
                    }
                    scheduler.run().await;
                }
            }
            info!("🛑 同步调度器已退出");
        });
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// 执行一次同步（含合并的追加运行）
    ///
    /// 已有运行在进行时只登记 rerun 标志后立即返回，
    /// 由持锁的运行在结束后消费。
    pub async fn run(&self) {
        let guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.rerun_requested.store(true, Ordering::SeqCst);
                debug!("🔁 同步进行中，触发已合并");
                return;
            }
        };
        self.drain_until_quiet().await;
        drop(guard);
    }

    /// 运行一次并等待结束
    ///
    /// 已有运行在进行时等它结束，随后自己再跑一轮。
    pub async fn run_to_completion(&self) {
        let guard = self.run_lock.lock().await;
        self.drain_until_quiet().await;
        drop(guard);

        // 结束于退避时把闸门交还后台循环，
        // 否则这些记录要等到下一次周期同步才会被重试
        if matches!(self.state().await, SchedulerState::Backoff { .. }) {
            self.wake.notify_one();
        }
    }

    async fn drain_until_quiet(&self) {
        loop {
            if let Err(e) = self.run_once().await {
                warn!("同步运行失败: {}", e);
                self.set_state(SchedulerState::Idle).await;
            }
            if !self.rerun_requested.swap(false, Ordering::SeqCst) {
                break;
            }
            debug!("🔁 消费合并触发，追加一次同步运行");
        }
    }

    /// 状态机走一遍：Checking -> Draining -> Reconciling
    async fn run_once(&self) -> Result<()> {
        self.set_state(SchedulerState::Checking).await;

        if !self.network.is_online() {
            debug!("网络离线，本轮同步跳过");
            self.set_state(SchedulerState::Idle).await;
            return Ok(());
        }
        if self.storage.pending_mutation_count().await? == 0 {
            self.set_state(SchedulerState::Idle).await;
            return Ok(());
        }

        self.events.emit(SdkEvent::SyncStarted);
        self.set_state(SchedulerState::Draining).await;

        let mut synced_total = 0usize;
        let mut reconciliation = None;

        loop {
            let batch = self
                .storage
                .peek_batch(self.config.batch_max_items, self.config.batch_max_bytes)
                .await?;
            if batch.is_empty() {
                break;
            }

            let ids: Vec<String> = batch.iter().map(|r| r.id.clone()).collect();
            self.storage.mark_in_flight(&ids).await?;

            // 在途的网络调用不可取消，超时按可重试传输失败处理
            let sent = tokio::time::timeout(
                self.config.transport_timeout,
                self.transport.send_batch(&batch),
            )
            .await;

            match sent {
                Ok(Ok(result)) => {
                    synced_total += self.route_outcomes(&batch, &result).await?;
                    if result.reconciliation.is_some() {
                        reconciliation = result.reconciliation;
                    }
                    // 部分成功：可重试记录被退避闸门挡住，继续排空其余队列
                }
                Ok(Err(e)) => {
                    return self.defer_batch(&batch, SyncFailureReason::from(e)).await;
                }
                Err(_elapsed) => {
                    return self
                        .defer_batch(&batch, SyncFailureReason::NetworkTimeout)
                        .await;
                }
            }
        }

        if let Some(result) = reconciliation {
            self.set_state(SchedulerState::Reconciling).await;
            // 先吸收已确认流水再落基线：服务端总分已覆盖它们，
            // 继续留在 pending 求和里会重复计数
            self.storage.absorb_confirmed_ledger_entries().await?;
            self.reconciler.apply(&result).await?;
        }

        self.storage
            .set_last_sync_at(Utc::now().timestamp_millis())
            .await?;
        let remaining = self.storage.pending_mutation_count().await? as usize;
        self.events.emit(SdkEvent::SyncCompleted {
            synced_count: synced_total,
            remaining_count: remaining,
        });
        info!("✅ 同步完成: 本轮确认 {} 条, 剩余 {} 条", synced_total, remaining);

        // 剩余记录都在退避闸门后面时重新武装定时器，
        // 否则下一次重试要等到周期同步才会发生
        if remaining > 0 {
            if let Some(due) = self.storage.next_retry_due_at().await? {
                self.set_state(SchedulerState::Backoff { until_ms: due }).await;
                return Ok(());
            }
        }

        self.set_state(SchedulerState::Idle).await;
        Ok(())
    }

    /// 路由逐条结果；返回本批确认数
    async fn route_outcomes(
        &self,
        batch: &[MutationRecord],
        result: &SyncBatchResult,
    ) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let mut synced_keys = Vec::new();

        for record in batch {
            match result.outcome_for(&record.idempotency_key) {
                // duplicate 等价于成功：服务端早已应用过这条变更
                Some(MutationOutcome::Acked) | Some(MutationOutcome::Duplicate) => {
                    synced_keys.push(record.idempotency_key.clone());
                    match record.entity_type {
                        EntityType::Progress => {
                            self.storage.mark_progress_synced(&record.entity_id).await?;
                        }
                        // 积分流水不在这里吸收：没有协调结果时基线
                        // 不会前移，提前标 synced 会让展示总分下坠
                        EntityType::Points => {}
                        EntityType::Achievement => {
                            self.storage
                                .mark_achievement_synced(&record.entity_id)
                                .await?;
                        }
                        EntityType::Session => {}
                    }
                }
                Some(MutationOutcome::Rejected(reason)) => {
                    // 单条坏记录不堵塞队列；完整现场进日志后转死信
                    warn!(
                        "服务端拒绝变更: {} reason={} payload={}",
                        record.details(),
                        reason,
                        record.payload
                    );
                    self.dead_letter(record, reason).await?;
                }
                None => {
                    // 服务端未对这条给出结果，按可重试处理
                    let reason = SyncFailureReason::Unknown("服务端未返回该条结果".to_string());
                    self.fail_record(record, &reason, now).await?;
                }
            }
        }

        self.storage.mark_mutations_synced(&synced_keys).await?;
        Ok(synced_keys.len())
    }

    /// 整批传输失败：全部按可重试路径处理并进入退避
    async fn defer_batch(
        &self,
        batch: &[MutationRecord],
        reason: SyncFailureReason,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut latest_retry_at = now;

        for record in batch {
            if let Some(retry_at) = self.fail_record(record, &reason, now).await? {
                latest_retry_at = latest_retry_at.max(retry_at);
            }
        }

        warn!(
            "⚠️ 批次传输失败({:?})，{} 条转入退避，最晚 {} 重试",
            reason,
            batch.len(),
            latest_retry_at
        );
        self.events.emit(SdkEvent::SyncDeferred {
            reason: format!("{:?}", reason),
            retry_at_ms: latest_retry_at,
        });
        self.set_state(SchedulerState::Backoff {
            until_ms: latest_retry_at,
        })
        .await;
        Ok(())
    }

    /// 单条失败：按重试决策转入可重试或死信；返回重试时刻
    async fn fail_record(
        &self,
        record: &MutationRecord,
        reason: &SyncFailureReason,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        // attempts 已在 mark_in_flight 时落库 +1，内存里的是旧值
        let attempts = record.attempts + 1;
        let error_text = format!("{:?}", reason);

        match self.retry.on_failure(attempts, reason, now_ms) {
            RetryDecision::RetryAt(at) => {
                self.storage
                    .mark_mutation_retryable(&record.id, &error_text, at)
                    .await?;
                Ok(Some(at))
            }
            RetryDecision::GiveUp => {
                self.dead_letter(record, &error_text).await?;
                Ok(None)
            }
        }
    }

    /// 转入死信，并级联处理依赖链
    ///
    /// 前置被拒后其依赖引用的服务端状态永远不会存在，
    /// 不级联的话这些记录会永远卡在依赖闸门后面。
    async fn dead_letter(&self, record: &MutationRecord, reason: &str) -> Result<()> {
        let mut worklist = vec![(record.id.clone(), record.entity_type, record.idempotency_key.clone(), reason.to_string())];

        while let Some((id, entity_type, key, why)) = worklist.pop() {
            self.storage.mark_mutation_terminal(&id, &why).await?;
            self.reporter.report(&id, entity_type, &why).await;
            self.events.emit(SdkEvent::MutationDeadLettered {
                record_id: id,
                entity_type,
                reason: why,
            });

            for dependent in self.storage.non_terminal_dependents_of(&key).await? {
                worklist.push((
                    dependent.id.clone(),
                    dependent.entity_type,
                    dependent.idempotency_key.clone(),
                    format!("前置变更已死信: {}", key),
                ));
            }
        }
        Ok(())
    }
}
