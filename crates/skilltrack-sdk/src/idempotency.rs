//! 幂等键派生与去重
//!
//! 幂等键是整个同步引擎依赖的唯一去重机制：
//! - 本地入队去重依赖它（mutation_queue 表的唯一索引）
//! - 服务端合约依赖它（重复提交同一键返回 duplicate，不二次发放）
//!
//! 派生必须是纯函数：相同输入在任何进程、任何重试中产生相同的键。

use crate::storage::entities::EntityType;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

const KEY_NAMESPACE: &str = "skilltrack:v1";

/// 派生幂等键
///
/// `version` 的取法按实体类型区分：
/// - 进度：该课程已记录的状态迁移次数（见 ProgressRecord::transitions）
/// - 积分：流水条目内容哈希（见 [`content_version`]）
///
/// 这样保证两个合法的不同事件得到不同的键，而同一事件的
/// 重复派生（快速重复点击、网络重试）坍缩到同一个键上。
pub fn derive_key(entity_type: EntityType, entity_id: &str, version: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(KEY_NAMESPACE.as_bytes());
    hasher.update(b":");
    hasher.update(entity_type.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(entity_id.as_bytes());
    hasher.update(b":");
    hasher.update(version.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// 从载荷内容派生 version（积分流水使用）
///
/// 取内容 SHA-256 的前 8 字节。载荷中包含单调序号，
/// 因此两笔金额相同的合法积分事件仍会得到不同的 version。
pub fn content_version(payload: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// 最近见过的幂等键缓存
///
/// 只是数据库唯一索引前面的一层快速挡板，用于在高频提交时
/// 省掉落库尝试；真正的去重保证来自唯一索引本身。
pub struct DedupCache {
    seen: Arc<Mutex<HashMap<String, Instant>>>,
    retention: Duration,
    cleanup_threshold: usize,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_config(Duration::from_secs(3600), 10_000)
    }

    pub fn with_config(retention: Duration, max_size: usize) -> Self {
        Self {
            seen: Arc::new(Mutex::new(HashMap::new())),
            retention,
            cleanup_threshold: max_size * 4 / 5,
        }
    }

    /// 检查键是否最近见过
    pub fn is_duplicate(&self, key: &str) -> bool {
        let seen = self.seen.lock().unwrap();
        if seen.contains_key(key) {
            debug!("🔄 检测到重复幂等键: {}", key);
            return true;
        }
        false
    }

    /// 标记键已见
    pub fn mark_seen(&self, key: &str) {
        let mut seen = self.seen.lock().unwrap();
        seen.insert(key.to_string(), Instant::now());
        if seen.len() > self.cleanup_threshold {
            let now = Instant::now();
            seen.retain(|_, at| now.duration_since(*at) <= self.retention);
        }
    }

    pub fn clear(&self) {
        self.seen.lock().unwrap().clear();
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let a = derive_key(EntityType::Progress, "lesson-1", 3);
        let b = derive_key(EntityType::Progress, "lesson-1", 3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // sha256 hex
    }

    #[test]
    fn test_distinct_inputs_distinct_keys() {
        let base = derive_key(EntityType::Progress, "lesson-1", 3);
        assert_ne!(base, derive_key(EntityType::Progress, "lesson-1", 4));
        assert_ne!(base, derive_key(EntityType::Progress, "lesson-2", 3));
        assert_ne!(base, derive_key(EntityType::Points, "lesson-1", 3));
    }

    #[test]
    fn test_content_version_distinguishes_sequenced_events() {
        let first = content_version(r#"{"amount":10,"seq":1}"#);
        let second = content_version(r#"{"amount":10,"seq":2}"#);
        assert_ne!(first, second);
        assert_eq!(first, content_version(r#"{"amount":10,"seq":1}"#));
    }

    #[test]
    fn test_dedup_cache() {
        let cache = DedupCache::new();
        assert!(!cache.is_duplicate("k1"));
        cache.mark_seen("k1");
        assert!(cache.is_duplicate("k1"));
        assert!(!cache.is_duplicate("k2"));
        cache.clear();
        assert!(!cache.is_duplicate("k1"));
    }
}
