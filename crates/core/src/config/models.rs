use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// 控制器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub listen_address: String,
    /// 同时处于活跃状态的Worker上限
    pub worker_max_count: usize,
    pub tick_interval_ms: u64,
    /// 积压的运行请求等待可用Worker的最长时间
    pub dispatch_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:7420".to_string(),
            worker_max_count: 4,
            tick_interval_ms: 50,
            dispatch_timeout_ms: 30_000,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen_address.trim().is_empty() {
            return Err(anyhow::anyhow!("监听地址不能为空"));
        }
        if self.worker_max_count == 0 {
            return Err(anyhow::anyhow!("活跃Worker上限必须大于0"));
        }
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("控制器循环间隔必须大于0"));
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(anyhow::anyhow!("分发超时时间必须大于0"));
        }
        Ok(())
    }
}

/// 由外部进程执行的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// 线程唯一标识, 同时也是向控制器登记的任务名
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Worker配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub controller_address: String,
    pub sync_timeout_ms: u64,
    pub announce_retry_limit: u32,
    pub application_id: String,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            controller_address: "127.0.0.1:7420".to_string(),
            sync_timeout_ms: 60_000,
            announce_retry_limit: 3,
            application_id: "default".to_string(),
            tasks: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.controller_address.trim().is_empty() {
            return Err(anyhow::anyhow!("控制器地址不能为空"));
        }
        if self.sync_timeout_ms == 0 {
            return Err(anyhow::anyhow!("同步超时时间必须大于0"));
        }
        if self.application_id.trim().is_empty() {
            return Err(anyhow::anyhow!("应用ID不能为空"));
        }

        let mut names = HashSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(anyhow::anyhow!("任务名不能为空"));
            }
            if task.program.trim().is_empty() {
                return Err(anyhow::anyhow!("任务 {} 没有指定程序", task.name));
            }
            if !names.insert(task.name.as_str()) {
                return Err(anyhow::anyhow!("任务名重复: {}", task.name));
            }
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// "pretty" 或 "json"
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub const LOG_FORMATS: [&'static str; 2] = ["pretty", "json"];
    pub const LOG_LEVELS: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];

    pub fn validate(&self) -> anyhow::Result<()> {
        if !Self::LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                Self::LOG_LEVELS
            ));
        }
        if !Self::LOG_FORMATS.contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志格式: {}，支持的格式: {:?}",
                self.log_format,
                Self::LOG_FORMATS
            ));
        }
        Ok(())
    }
}
