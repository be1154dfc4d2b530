//! 课程内容可用性 - 下载器的能力边界
//!
//! 同步引擎只同步进度、积分与成就，不下载课程内容；
//! 它对内容层的全部依赖就是"这节课在本地可用吗"这一个事实。

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 内容提供方能力接口
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn is_lesson_available(&self, lesson_id: &str) -> bool;
}

/// 内存实现：宿主在下载完成时登记课程
///
/// 也是测试中模拟"课程未下载"场景的默认实现。
#[derive(Clone, Default)]
pub struct LocalContentRegistry {
    available: Arc<RwLock<HashSet<String>>>,
}

impl LocalContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark_available(&self, lesson_id: &str) {
        self.available.write().await.insert(lesson_id.to_string());
    }

    pub async fn mark_unavailable(&self, lesson_id: &str) {
        self.available.write().await.remove(lesson_id);
    }
}

#[async_trait]
impl ContentProvider for LocalContentRegistry {
    async fn is_lesson_available(&self, lesson_id: &str) -> bool {
        self.available.read().await.contains(lesson_id)
    }
}
