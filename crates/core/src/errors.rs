use thiserror::Error;

/// 控制器与Worker共用的错误类型
#[derive(Debug, Error)]
pub enum SawError {
    #[error("未知命令: {name}")]
    UnknownCommand { name: String },

    #[error("消息格式错误: {0}")]
    MalformedMessage(String),

    #[error("无效的命令 {command}: 缺少字段 {missing:?}")]
    InvalidCommand {
        command: String,
        missing: Vec<String>,
    },

    #[error("命令 {command} 状态转换非法: {from} -> {to}")]
    InvalidState {
        command: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("命令发送失败: {command} (id={id})")]
    CommandSendFailed { command: String, id: u64 },

    #[error("命令结果发送失败: {command} (id={id})")]
    CommandResultSendFailed { command: String, id: u64 },

    #[error("违反协议不变量: {0}")]
    InvariantViolation(String),

    #[error("命令未得到结果即被丢弃: id={id}")]
    CommandAbandoned { id: u64 },

    #[error("线程唯一标识已存在: {unique_id}")]
    DuplicateThreadId { unique_id: String },

    #[error("线程不属于当前线程池: {unique_id}")]
    UnknownThread { unique_id: String },

    #[error("线程没有关联线程: {unique_id}")]
    NoLinkedThread { unique_id: String },

    #[error("线程同步超时, 未完成: {pending:?}")]
    SynchronizeTimeout { pending: Vec<String> },

    #[error("线程启动失败: {failed:?}")]
    ThreadStartFailed { failed: Vec<String> },

    #[error("运行标识已存在: run_id={run_id}")]
    DuplicateRunId { run_id: u64 },

    #[error("未知的运行: run_id={run_id}")]
    UnknownRun { run_id: u64 },

    #[error("Worker不存在: connection={connection}")]
    WorkerNotFound { connection: u64 },

    #[error("未知的应用: {id}")]
    UnknownApplication { id: String },

    #[error("应用已存在: {id}")]
    DuplicateApplication { id: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SawResult<T> = std::result::Result<T, SawError>;

impl SawError {
    pub fn unknown_command<S: Into<String>>(name: S) -> Self {
        Self::UnknownCommand { name: name.into() }
    }
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedMessage(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 只有不变量被破坏才终止对应的命令流程
    pub fn is_fatal(&self) -> bool {
        matches!(self, SawError::InvariantViolation(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SawError::CommandSendFailed { .. }
                | SawError::CommandResultSendFailed { .. }
                | SawError::CommandAbandoned { .. }
                | SawError::Network(_)
        )
    }
}

impl From<serde_json::Error> for SawError {
    fn from(err: serde_json::Error) -> Self {
        SawError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SawError {
    fn from(err: std::io::Error) -> Self {
        SawError::Network(err.to_string())
    }
}

impl From<config::ConfigError> for SawError {
    fn from(err: config::ConfigError) -> Self {
        SawError::Configuration(err.to_string())
    }
}

impl From<anyhow::Error> for SawError {
    fn from(err: anyhow::Error) -> Self {
        SawError::Internal(err.to_string())
    }
}
