//! 网络状态监视器
//!
//! SDK 自身不探测网络，由宿主应用在连接变化时上报；
//! 调度器订阅状态变化，在恢复在线时唤醒同步。

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Online,
    Offline,
}

/// 网络监视器
///
/// watch 通道保存最新状态，任意多个订阅者等待变化。
#[derive(Clone)]
pub struct NetworkMonitor {
    sender: Arc<watch::Sender<NetworkState>>,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        // 宿主未上报前按离线处理，避免对着空网络发起首次同步
        let (sender, _) = watch::channel(NetworkState::Offline);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// 宿主应用上报网络状态变化
    pub fn set_state(&self, state: NetworkState) {
        if *self.sender.borrow() != state {
            info!("🌐 网络状态变化: {:?}", state);
            // send 在没有订阅者时不落值，这里必须无条件替换：
            // 上报可能发生在调度器订阅之前
            self.sender.send_replace(state);
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow() == NetworkState::Online
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.sender.subscribe()
    }

    /// 等待直到在线
    pub async fn wait_online(&self) {
        let mut receiver = self.sender.subscribe();
        loop {
            if *receiver.borrow() == NetworkState::Online {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}
