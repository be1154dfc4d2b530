//! 数据访问层 - 每张表一个专门的操作模块
//!
//! DAO 持有 `&Connection`，由 StorageManager 在锁内创建并使用；
//! 外部代码不直接接触 SQL。

pub mod achievement;
pub mod mutation_queue;
pub mod points_ledger;
pub mod progress;

pub use achievement::AchievementDao;
pub use mutation_queue::MutationQueueDao;
pub use points_ledger::PointsLedgerDao;
pub use progress::ProgressDao;
