use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::errors::{SawError, SawResult};
use crate::protocol::{from_data, CommandCode, CommandData, CommandState, Frame, WireMessage};
use crate::transport::Peer;

/// 控制器和Worker之间交换的命令种类（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Worker 向控制器登记自己
    WorkerAdd,
    /// Worker 下线
    WorkerDelete,
    /// Worker 得知了一个新的任务（线程唯一标识）
    ThreadKnow,
    /// 请求运行一个线程
    ThreadRun,
    /// 线程运行结果
    ThreadResult,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        CommandKind::WorkerAdd,
        CommandKind::WorkerDelete,
        CommandKind::ThreadKnow,
        CommandKind::ThreadRun,
        CommandKind::ThreadResult,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::WorkerAdd => "wadd",
            CommandKind::WorkerDelete => "wdel",
            CommandKind::ThreadKnow => "tadd",
            CommandKind::ThreadRun => "trun",
            CommandKind::ThreadResult => "tres",
        }
    }

    pub fn from_name(name: &str) -> Option<CommandKind> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// 发送前必须出现在数据中的字段
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            CommandKind::WorkerAdd | CommandKind::WorkerDelete => &[],
            CommandKind::ThreadKnow => &["name"],
            CommandKind::ThreadRun => &["run_id", "application_id", "unique_id", "arguments"],
            CommandKind::ThreadResult => {
                &["run_id", "application_id", "unique_id", "success", "result"]
            }
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 一个有状态、带关联标识的命令
///
/// 发起方用 [`Command::run`] 发出请求; 接收方的调度器根据线路数据重建
/// 一个同名同标识的命令, 处理完成后调用 [`Command::success`] 或
/// [`Command::error`] 把结果送回。两端的对象只通过名称和关联标识联系在一起。
pub struct Command {
    kind: CommandKind,
    id: u64,
    state: CommandState,
    code: CommandCode,
    data: CommandData,
    peer: Arc<dyn Peer>,
}

impl Command {
    pub fn new(kind: CommandKind, id: u64, peer: Arc<dyn Peer>) -> Self {
        Self::restore(kind, id, peer, CommandState::New, CommandCode::Void)
    }

    pub(crate) fn restore(
        kind: CommandKind,
        id: u64,
        peer: Arc<dyn Peer>,
        state: CommandState,
        code: CommandCode,
    ) -> Self {
        Self {
            kind,
            id,
            state,
            code,
            data: CommandData::new(),
            peer,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// 命令的关联标识, 不要和线程标识混淆
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn code(&self) -> CommandCode {
        self.code
    }

    pub fn data(&self) -> &CommandData {
        &self.data
    }

    pub fn peer(&self) -> &Arc<dyn Peer> {
        &self.peer
    }

    pub fn is_success(&self) -> bool {
        self.code == CommandCode::Success
    }

    pub fn is_error(&self) -> bool {
        self.code == CommandCode::Error
    }

    /// 只合并声明过的字段, 其余字段丢弃
    pub fn handle(&mut self, payload: &CommandData) -> &mut Self {
        for field in self.kind.required_fields() {
            if let Some(value) = payload.get(*field) {
                self.data.insert((*field).to_string(), value.clone());
            }
        }
        self
    }

    pub fn is_valid(&self, payload: &CommandData) -> bool {
        self.missing_fields(payload).is_empty()
    }

    fn missing_fields(&self, payload: &CommandData) -> Vec<String> {
        self.kind
            .required_fields()
            .iter()
            .filter(|field| !payload.contains_key(**field))
            .map(|field| field.to_string())
            .collect()
    }

    /// 把命令发送给对端执行
    pub fn run(&mut self, payload: CommandData) -> SawResult<()> {
        if self.state != CommandState::New {
            return Err(self.invalid_transition(CommandState::Running));
        }
        let missing = self.missing_fields(&payload);
        if !missing.is_empty() {
            return Err(SawError::InvalidCommand {
                command: self.name().to_string(),
                missing,
            });
        }
        self.state = CommandState::Running;
        let frame = Frame::Command(self.envelope(payload));
        if !self.peer.send(frame) {
            return Err(SawError::CommandSendFailed {
                command: self.name().to_string(),
                id: self.id,
            });
        }
        debug!(command = self.name(), id = self.id, "命令已发送");
        Ok(())
    }

    /// 把当前数据作为结果发回请求方
    pub fn result(&mut self) -> SawResult<()> {
        if self.state != CommandState::Running {
            return Err(self.invalid_transition(CommandState::Resulted));
        }
        if self.code == CommandCode::Void {
            return Err(SawError::InvariantViolation(format!(
                "命令 {} (id={}) 没有结果码",
                self.name(),
                self.id
            )));
        }
        self.state = CommandState::Resulted;
        let frame = Frame::Command(self.envelope(self.data.clone()));
        if !self.peer.send(frame) {
            return Err(SawError::CommandResultSendFailed {
                command: self.name().to_string(),
                id: self.id,
            });
        }
        debug!(
            command = self.name(),
            id = self.id,
            code = ?self.code,
            "命令结果已发送"
        );
        Ok(())
    }

    pub fn success(&mut self) -> SawResult<()> {
        self.code = CommandCode::Success;
        self.result()
    }

    pub fn error(&mut self) -> SawResult<()> {
        self.code = CommandCode::Error;
        self.result()
    }

    /// 附带原因后以失败结束
    pub fn fail(&mut self, reason: impl Into<String>) -> SawResult<()> {
        self.data
            .insert("error".to_string(), Value::String(reason.into()));
        self.error()
    }

    /// 设置随结果返回的数据
    pub fn set_data(&mut self, data: CommandData) -> &mut Self {
        self.data = data;
        self
    }

    /// 按命令声明的数据结构解析
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> SawResult<T> {
        from_data(&self.data)
            .map_err(|e| SawError::malformed(format!("命令 {} 数据无效: {e}", self.name())))
    }

    pub fn envelope(&self, data: CommandData) -> WireMessage {
        WireMessage {
            command: self.name().to_string(),
            state: self.state,
            id: self.id,
            code: self.code,
            data,
        }
    }

    fn invalid_transition(&self, to: CommandState) -> SawError {
        SawError::InvalidState {
            command: self.name().to_string(),
            from: self.state.as_str(),
            to: to.as_str(),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("state", &self.state)
            .field("code", &self.code)
            .field("data", &self.data)
            .field("peer", &self.peer.connection_id())
            .finish()
    }
}
