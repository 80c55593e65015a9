use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 优雅关闭管理器
///
/// 关闭信号只发送一次；关闭之后的订阅者会立即收到信号。
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    /// 等待驱动中的DDL任务退出的最长时间
    drain_timeout: Duration,
}

impl ShutdownManager {
    pub fn new(drain_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            shutdown_tx: Arc::new(RwLock::new(Some(shutdown_tx))),
            drain_timeout,
        }
    }

    /// 订阅关闭信号
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        let shutdown_tx = self.shutdown_tx.read().await;
        match shutdown_tx.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                let _ = tx.send(());
                rx
            }
        }
    }

    /// 触发关闭，重复调用无副作用
    pub async fn shutdown(&self) {
        let mut shutdown_tx = self.shutdown_tx.write().await;
        match shutdown_tx.take() {
            Some(tx) => {
                debug!("发送关闭信号给 {} 个订阅者", tx.receiver_count());
                let _ = tx.send(());
                info!("关闭信号已发送");
            }
            None => debug!("关闭信号已经发送过"),
        }
    }

    pub async fn is_shutdown(&self) -> bool {
        self.shutdown_tx.read().await.is_none()
    }

    /// 发送关闭信号并等待 `drain` 完成；超时返回 `false`，剩余任务交给其他节点接管
    pub async fn graceful_shutdown<F>(&self, drain: F) -> bool
    where
        F: Future<Output = ()> + Send,
    {
        self.shutdown().await;

        info!(
            "等待驱动中的DDL任务退出（超时: {}秒）",
            self.drain_timeout.as_secs()
        );
        match timeout(self.drain_timeout, drain).await {
            Ok(()) => {
                info!("所有DDL任务驱动已退出");
                true
            }
            Err(_) => {
                warn!(
                    "等待DDL任务退出超时（{}秒），未完成的任务将在租约过期后被接管",
                    self.drain_timeout.as_secs()
                );
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
