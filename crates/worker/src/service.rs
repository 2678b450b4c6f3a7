use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use saw_core::{SawError, SawResult, TcpConnection, WorkerConfig};

use crate::application::ApplicationContainer;
use crate::worker::WorkerCore;

const CONTROLLER_CONNECTION: u64 = 1;

/// 连接控制器并运行Worker循环
pub struct WorkerService {
    config: WorkerConfig,
    applications: ApplicationContainer,
}

impl WorkerService {
    pub fn new(config: WorkerConfig, applications: ApplicationContainer) -> Self {
        Self {
            config,
            applications,
        }
    }

    /// 运行到连接断开、控制器要求退出或收到关闭信号为止
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> SawResult<()> {
        let stream = TcpStream::connect(&self.config.controller_address)
            .await
            .map_err(|e| {
                SawError::Network(format!(
                    "无法连接控制器 {}: {e}",
                    self.config.controller_address
                ))
            })?;
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel();
        let connection = TcpConnection::spawn(stream, CONTROLLER_CONNECTION, inbound_tx)?;
        info!(
            controller = %self.config.controller_address,
            applications = self.applications.len(),
            "已连接控制器"
        );

        let mut core = WorkerCore::new(&self.config, self.applications, connection, feedback_tx);
        while !core.is_stopped() {
            tokio::select! {
                inbound = inbound_rx.recv() => match inbound {
                    Some(inbound) => core.on_inbound(inbound),
                    None => break,
                },
                Some(feedback) = feedback_rx.recv() => core.on_feedback(feedback),
                _ = shutdown.recv() => {
                    info!("Worker收到关闭信号");
                    core.shutdown();
                }
            }
        }

        core.shutdown();
        info!("Worker服务已退出");
        Ok(())
    }
}
