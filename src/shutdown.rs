use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 控制器和Worker的循环各自订阅一个接收端, 在 `select!` 中等待关闭信号。
#[derive(Clone)]
pub struct ShutdownManager {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(4);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 订阅关闭信号; 已经关闭时返回的接收端会立即收到信号
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.is_shutdown() {
            let (sender, receiver) = broadcast::channel(1);
            let _ = sender.send(());
            return receiver;
        }
        self.sender.subscribe()
    }

    /// 触发关闭, 只有第一次调用会广播
    pub fn shutdown(&self) -> bool {
        if self.triggered.swap(true, Ordering::SeqCst) {
            debug!("关闭已经触发过");
            return false;
        }
        let receivers = self.sender.send(()).unwrap_or(0);
        info!(receivers, "关闭信号已发送");
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_all_subscribers_receive_signal() {
        let manager = ShutdownManager::new();
        let mut first = manager.subscribe();
        let mut second = manager.clone().subscribe();

        assert!(manager.shutdown());
        assert!(timeout(Duration::from_millis(100), first.recv()).await.is_ok());
        assert!(timeout(Duration::from_millis(100), second.recv()).await.is_ok());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_fires_immediately() {
        let manager = ShutdownManager::new();
        manager.shutdown();
        let mut late = manager.subscribe();
        assert!(timeout(Duration::from_millis(100), late.recv()).await.is_ok());
    }

    #[test]
    fn test_second_shutdown_is_a_no_op() {
        let manager = ShutdownManager::new();
        assert!(manager.shutdown());
        assert!(!manager.shutdown());
    }
}
