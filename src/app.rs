use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use saw_controller::ControllerServer;
use saw_core::SawConfig;
use saw_worker::{ApplicationContainer, ConfiguredApplication, WorkerService};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Controller,
    Worker,
}

impl AppMode {
    pub const NAMES: [&'static str; 2] = ["controller", "worker"];

    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "controller" => Ok(AppMode::Controller),
            "worker" => Ok(AppMode::Worker),
            other => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppMode::Controller => f.write_str("controller"),
            AppMode::Worker => f.write_str("worker"),
        }
    }
}

/// 主应用程序
pub struct Application {
    config: SawConfig,
    mode: AppMode,
}

impl Application {
    pub fn new(config: SawConfig, mode: AppMode) -> Self {
        Self { config, mode }
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {}", self.mode);
        match self.mode {
            AppMode::Controller => self.run_controller(shutdown_rx).await,
            AppMode::Worker => self.run_worker(shutdown_rx).await,
        }
    }

    async fn run_controller(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let server = ControllerServer::bind(self.config.controller.clone())
            .await
            .context("启动控制器失败")?;
        server.run(shutdown_rx).await.context("控制器运行失败")
    }

    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let worker = &self.config.worker;
        let mut applications = ApplicationContainer::new();
        applications
            .add(Arc::new(ConfiguredApplication::new(
                worker.application_id.clone(),
                worker.tasks.clone(),
            )))
            .context("注册应用失败")?;
        info!(
            application = %worker.application_id,
            tasks = worker.tasks.len(),
            "Worker应用已配置"
        );

        WorkerService::new(worker.clone(), applications)
            .run(shutdown_rx)
            .await
            .context("Worker运行失败")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownManager;
    use std::time::Duration;

    #[test]
    fn test_parse_mode() {
        assert_eq!(AppMode::parse("controller").unwrap(), AppMode::Controller);
        assert_eq!(AppMode::parse("worker").unwrap(), AppMode::Worker);
        assert!(AppMode::parse("all").is_err());
    }

    #[tokio::test]
    async fn test_controller_stops_on_shutdown_signal() {
        let mut config = SawConfig::default();
        config.controller.listen_address = "127.0.0.1:0".to_string();
        let app = Application::new(config, AppMode::Controller);

        let shutdown = ShutdownManager::new();
        let receiver = shutdown.subscribe();
        let handle = tokio::spawn(async move { app.run(receiver).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_worker_without_controller_fails_to_connect() {
        let mut config = SawConfig::default();
        // 端口0无法连接
        config.worker.controller_address = "127.0.0.1:0".to_string();
        let app = Application::new(config, AppMode::Worker);
        let shutdown = ShutdownManager::new();
        assert!(app.run(shutdown.subscribe()).await.is_err());
    }
}
