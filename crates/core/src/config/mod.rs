use std::path::Path;

use anyhow::Context;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

mod models;

pub use models::{ControllerConfig, ObservabilityConfig, TaskSpec, WorkerConfig};

use crate::errors::{SawError, SawResult};

/// 环境变量前缀, 层级之间用 `__` 分隔
pub const ENV_PREFIX: &str = "SAW";

const DEFAULT_PATHS: [&str; 3] = ["config/saw.toml", "saw.toml", "/etc/saw/config.toml"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SawConfig {
    pub controller: ControllerConfig,
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
}

impl SawConfig {
    /// 依次合并默认值、配置文件和环境变量
    pub fn load(config_path: Option<&str>) -> SawResult<Self> {
        let defaults = SawConfig::default();
        let mut builder = ConfigBuilder::builder()
            .set_default(
                "controller.listen_address",
                defaults.controller.listen_address.clone(),
            )?
            .set_default(
                "controller.worker_max_count",
                defaults.controller.worker_max_count as u64,
            )?
            .set_default(
                "controller.tick_interval_ms",
                defaults.controller.tick_interval_ms,
            )?
            .set_default(
                "controller.dispatch_timeout_ms",
                defaults.controller.dispatch_timeout_ms,
            )?
            .set_default(
                "worker.controller_address",
                defaults.worker.controller_address.clone(),
            )?
            .set_default("worker.sync_timeout_ms", defaults.worker.sync_timeout_ms)?
            .set_default(
                "worker.announce_retry_limit",
                u64::from(defaults.worker.announce_retry_limit),
            )?
            .set_default("worker.application_id", defaults.worker.application_id.clone())?
            .set_default("observability.log_level", defaults.observability.log_level.clone())?
            .set_default(
                "observability.log_format",
                defaults.observability.log_format.clone(),
            )?;

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(SawError::config_error(format!("配置文件不存在: {path}")));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_PATHS.iter().find(|p| Path::new(p).exists()) {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: SawConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> SawResult<Self> {
        let config: SawConfig = toml::from_str(toml_str)
            .map_err(|e| SawError::config_error(format!("解析TOML配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> SawResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SawError::config_error(format!("序列化配置为TOML失败: {e}")))
    }

    pub fn validate(&self) -> SawResult<()> {
        self.validate_sections()
            .map_err(|e| SawError::config_error(format!("{e:#}")))
    }

    fn validate_sections(&self) -> anyhow::Result<()> {
        self.controller
            .validate()
            .context("控制器配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.observability
            .validate()
            .context("日志配置验证失败")?;
        Ok(())
    }
}
