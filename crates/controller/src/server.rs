use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use saw_core::{ConnectionId, ControllerConfig, SawError, SawResult, TcpConnection};

use crate::controller::ControllerCore;

/// 控制器的TCP服务
pub struct ControllerServer {
    config: ControllerConfig,
    listener: TcpListener,
}

impl ControllerServer {
    pub async fn bind(config: ControllerConfig) -> SawResult<Self> {
        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|e| {
                SawError::Network(format!("无法监听 {}: {e}", config.listen_address))
            })?;
        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> SawResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 运行控制器循环直到收到关闭信号
    ///
    /// 只有监听套接字本身出错才会返回错误。
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> SawResult<()> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel();
        let mut core = ControllerCore::new(&self.config, feedback_tx);

        let mut ticker = interval(core.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_connection: ConnectionId = 0;

        info!(
            address = %self.local_addr()?,
            max_workers = self.config.worker_max_count,
            "控制器已启动"
        );

        let result = loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            next_connection += 1;
                            match TcpConnection::spawn(stream, next_connection, inbound_tx.clone()) {
                                Ok(connection) => core.on_connect(connection),
                                Err(e) => warn!("建立连接失败: {}", e),
                            }
                        }
                        Err(e) => {
                            error!("监听套接字出错: {}", e);
                            break Err(SawError::from(e));
                        }
                    }
                }
                Some(inbound) = inbound_rx.recv() => core.on_inbound(inbound),
                Some(feedback) = feedback_rx.recv() => core.on_feedback(feedback),
                _ = ticker.tick() => core.work(Instant::now()),
                _ = shutdown.recv() => {
                    info!("控制器收到关闭信号");
                    break Ok(());
                }
            }
        };

        core.shutdown();
        info!("控制器已停止");
        result
    }
}
