//! KV 存储模块 - 基于 sled 的同步元数据存储
//!
//! 存放不属于任何实体表的同步状态：
//! - 服务端确认的积分基线与连续学习天数
//! - 最近一次成功同步的时间戳
//! - 按实体的单调序号计数器（幂等键 version 来源之一）
//! - 客户端与服务端时钟偏移

use crate::error::{Result, SkilltrackSDKError};
use serde::{de::DeserializeOwned, Serialize};
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 元数据键常量
pub mod meta_keys {
    /// 服务端确认的积分基线
    pub const POINTS_BASELINE: &str = "baseline:points";
    /// 服务端确认的连续学习天数
    pub const STREAK_DAYS: &str = "baseline:streak";
    /// 最近一次成功同步时间戳（毫秒）
    pub const LAST_SYNC_AT: &str = "sync:last_at";
    /// 服务端时钟偏移（毫秒，server - client）
    pub const SERVER_CLOCK_OFFSET: &str = "sync:clock_offset_ms";
}

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    #[allow(dead_code)]
    base_path: PathBuf,
    db: Arc<Db>,
    /// 学习者专属的 Tree 实例
    learner_trees: Arc<RwLock<HashMap<String, Tree>>>,
    current_learner: Arc<RwLock<Option<String>>>,
}

impl KvStore {
    pub async fn new(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| SkilltrackSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        let db = sled::open(&kv_path)
            .map_err(|e| SkilltrackSDKError::KvStore(format!("打开 sled 数据库失败: {}", e)))?;

        Ok(Self {
            base_path: base_path.to_path_buf(),
            db: Arc::new(db),
            learner_trees: Arc::new(RwLock::new(HashMap::new())),
            current_learner: Arc::new(RwLock::new(None)),
        })
    }

    /// 初始化学习者 Tree
    pub async fn init_learner_tree(&self, learner_id: &str) -> Result<()> {
        let tree_name = format!("learner_{}", learner_id);
        let tree = self
            .db
            .open_tree(&tree_name)
            .map_err(|e| SkilltrackSDKError::KvStore(format!("打开学习者 Tree 失败: {}", e)))?;

        let mut trees = self.learner_trees.write().await;
        trees.insert(learner_id.to_string(), tree);
        Ok(())
    }

    /// 切换学习者
    pub async fn switch_learner(&self, learner_id: &str) -> Result<()> {
        let trees = self.learner_trees.read().await;
        if !trees.contains_key(learner_id) {
            drop(trees);
            self.init_learner_tree(learner_id).await?;
        }

        let mut current = self.current_learner.write().await;
        *current = Some(learner_id.to_string());
        Ok(())
    }

    async fn get_current_tree(&self) -> Result<Tree> {
        let current = self.current_learner.read().await;
        let learner_id = current
            .as_ref()
            .ok_or_else(|| SkilltrackSDKError::NotInitialized("未选择学习者".to_string()))?;

        let trees = self.learner_trees.read().await;
        let tree = trees
            .get(learner_id)
            .ok_or_else(|| SkilltrackSDKError::KvStore("学习者 Tree 不存在".to_string()))?;
        Ok(tree.clone())
    }

    /// 设置键值对（JSON 序列化）
    pub async fn set<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let tree = self.get_current_tree().await?;
        let bytes = serde_json::to_vec(value)
            .map_err(|e| SkilltrackSDKError::Serialization(format!("序列化值失败: {}", e)))?;
        tree.insert(key.as_bytes(), bytes)
            .map_err(|e| SkilltrackSDKError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    /// 读取键值对
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let tree = self.get_current_tree().await?;
        match tree
            .get(key.as_bytes())
            .map_err(|e| SkilltrackSDKError::KvStore(format!("读取键值对失败: {}", e)))?
        {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| SkilltrackSDKError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键
    pub async fn delete(&self, key: &str) -> Result<()> {
        let tree = self.get_current_tree().await?;
        tree.remove(key.as_bytes())
            .map_err(|e| SkilltrackSDKError::KvStore(format!("删除键失败: {}", e)))?;
        Ok(())
    }

    /// 原子递增并返回序号计数器（从 1 开始）
    ///
    /// 用作进度之外实体的幂等键 version 输入，必须原子，
    /// 否则并发入队会派生出相同的键。
    pub async fn next_sequence(&self, counter_key: &str) -> Result<u64> {
        let tree = self.get_current_tree().await?;
        let key = format!("seq:{}", counter_key);
        let updated = tree
            .update_and_fetch(key.as_bytes(), |old| {
                let current = old
                    .and_then(|b| <[u8; 8]>::try_from(b).ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(0);
                Some(current.wrapping_add(1).to_be_bytes().to_vec())
            })
            .map_err(|e| SkilltrackSDKError::KvStore(format!("递增序号失败: {}", e)))?;

        let bytes = updated
            .ok_or_else(|| SkilltrackSDKError::KvStore("序号计数器丢失".to_string()))?;
        let value = <[u8; 8]>::try_from(bytes.as_ref())
            .map_err(|_| SkilltrackSDKError::KvStore("序号计数器损坏".to_string()))?;
        Ok(u64::from_be_bytes(value))
    }

    /// 清空学习者数据
    pub async fn cleanup_learner(&self, learner_id: &str) -> Result<()> {
        let mut trees = self.learner_trees.write().await;
        trees.remove(learner_id);

        let tree_name = format!("learner_{}", learner_id);
        self.db
            .drop_tree(&tree_name)
            .map_err(|e| SkilltrackSDKError::KvStore(format!("删除学习者 Tree 失败: {}", e)))?;
        Ok(())
    }
}
