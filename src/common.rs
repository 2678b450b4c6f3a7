use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use saw_core::{ObservabilityConfig, SawConfig};

use crate::app::{AppMode, Application};
use crate::shutdown::ShutdownManager;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// 命令行给出的启动参数, 未给出的项使用配置中的值
#[derive(Debug, Clone, Default)]
pub struct StartupConfig {
    pub config_path: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub listen_address: Option<String>,
    pub max_workers: Option<usize>,
    pub controller_address: Option<String>,
}

impl StartupConfig {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let text = |id: &str| {
            matches
                .try_get_one::<String>(id)
                .ok()
                .flatten()
                .cloned()
        };
        Self {
            config_path: text("config"),
            log_level: text("log-level"),
            log_format: text("log-format"),
            listen_address: text("listen"),
            max_workers: matches.try_get_one::<usize>("max-workers").ok().flatten().copied(),
            controller_address: text("controller"),
        }
    }
}

/// 初始化日志系统, `RUST_LOG` 优先于给定的级别
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 加载配置并应用命令行覆盖
pub fn load_config(startup: &StartupConfig) -> Result<SawConfig> {
    let mut config = SawConfig::load(startup.config_path.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            startup.config_path.as_deref().unwrap_or("<默认路径>")
        )
    })?;

    if let Some(ref level) = startup.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(ref format) = startup.log_format {
        config.observability.log_format = format.clone();
    }
    if let Some(ref address) = startup.listen_address {
        config.controller.listen_address = address.clone();
    }
    if let Some(count) = startup.max_workers {
        config.controller.worker_max_count = count;
    }
    if let Some(ref address) = startup.controller_address {
        config.worker.controller_address = address.clone();
    }

    config.validate().context("命令行参数无效")?;
    Ok(config)
}

/// 所有入口共用的参数
pub fn common_args() -> Vec<Arg> {
    vec![
        Arg::new("config")
            .short('c')
            .long("config")
            .value_name("FILE")
            .help("配置文件路径"),
        Arg::new("log-level")
            .short('l')
            .long("log-level")
            .value_name("LEVEL")
            .help("日志级别")
            .value_parser(ObservabilityConfig::LOG_LEVELS),
        Arg::new("log-format")
            .long("log-format")
            .value_name("FORMAT")
            .help("日志格式")
            .value_parser(ObservabilityConfig::LOG_FORMATS),
    ]
}

pub fn controller_args() -> Vec<Arg> {
    vec![
        Arg::new("listen")
            .long("listen")
            .value_name("ADDR")
            .help("控制器监听地址"),
        Arg::new("max-workers")
            .long("max-workers")
            .value_name("COUNT")
            .help("同时活跃的Worker上限")
            .value_parser(clap::value_parser!(usize)),
    ]
}

pub fn worker_args() -> Vec<Arg> {
    vec![Arg::new("controller")
        .long("controller")
        .value_name("ADDR")
        .help("控制器地址")]
}

/// 构建固定模式的命令行并启动
pub async fn run_cli(
    name: &'static str,
    about: &'static str,
    mode: AppMode,
    service_name: &str,
) -> Result<()> {
    let custom_args = match mode {
        AppMode::Controller => controller_args(),
        AppMode::Worker => worker_args(),
    };
    let matches = Command::new(name)
        .version(env!("CARGO_PKG_VERSION"))
        .about(about)
        .args(common_args())
        .args(custom_args)
        .get_matches();

    start_application(StartupConfig::from_matches(&matches), mode, service_name).await
}

/// 启动应用程序的通用函数
pub async fn start_application(
    startup: StartupConfig,
    mode: AppMode,
    service_name: &str,
) -> Result<()> {
    let config = load_config(&startup)?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    info!("启动 {} 服务", service_name);
    if let Some(ref path) = startup.config_path {
        info!("配置文件: {}", path);
    }
    info!("运行模式: {}", mode);

    let app = Application::new(config, mode);
    let shutdown_manager = ShutdownManager::new();
    let shutdown_rx = shutdown_manager.subscribe();
    let mut app_handle = tokio::spawn(async move { app.run(shutdown_rx).await });

    // 服务可能因为连接断开等原因自行退出
    let finished = tokio::select! {
        result = &mut app_handle => Some(result),
        _ = wait_for_shutdown_signal() => None,
    };

    let result = match finished {
        Some(result) => result,
        None => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown();
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, app_handle).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("{} 服务关闭超时，强制退出", service_name);
                    return Ok(());
                }
            }
        }
    };

    match result {
        Ok(Ok(())) => info!("{} 服务已退出", service_name),
        Ok(Err(e)) => {
            error!("{} 服务运行失败: {:#}", service_name, e);
            return Err(e);
        }
        Err(e) => {
            error!("{} 服务异常结束: {}", service_name, e);
            return Err(e.into());
        }
    }
    Ok(())
}

/// 等待关闭信号
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
