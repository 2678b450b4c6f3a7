use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::command::{Command, CommandKind};
use crate::commander::Commander;
use crate::errors::{SawError, SawResult};
use crate::protocol::{CommandState, WireMessage};
use crate::transport::Peer;

type HandlerFn<C> = Box<dyn Fn(&mut C, Command) -> SawResult<()> + Send + Sync>;

/// 命令注册项
///
/// 没有处理函数的命令只会被发送出去并接收结果, 不会在本端执行。
pub struct CommandHandler<C> {
    kind: CommandKind,
    handler: Option<HandlerFn<C>>,
}

impl<C> CommandHandler<C> {
    pub fn new<F>(kind: CommandKind, handler: F) -> Self
    where
        F: Fn(&mut C, Command) -> SawResult<()> + Send + Sync + 'static,
    {
        Self {
            kind,
            handler: Some(Box::new(handler)),
        }
    }

    pub fn passive(kind: CommandKind) -> Self {
        Self {
            kind,
            handler: None,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn is_executable(&self) -> bool {
        self.handler.is_some()
    }
}

/// 一条消息被调度后的去向
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// 本端处理函数已执行
    Handled,
    /// 解决了本端的一个待决命令
    Resolved,
    /// 过期或重复的结果, 已丢弃
    Unsolicited,
    /// 本端没有处理函数, 已回复失败
    Refused,
}

/// 命令调度器, 上下文 `C` 是处理函数操作的状态
pub struct Dispatcher<C> {
    handlers: HashMap<&'static str, CommandHandler<C>>,
    commander: Commander,
}

impl<C> Dispatcher<C> {
    pub fn new(commander: Commander) -> Self {
        Self {
            handlers: HashMap::new(),
            commander,
        }
    }

    pub fn commander(&self) -> &Commander {
        &self.commander
    }

    /// 同名注册以最后一次为准
    pub fn add(&mut self, handlers: impl IntoIterator<Item = CommandHandler<C>>) {
        for handler in handlers {
            if self.handlers.contains_key(handler.kind.name()) {
                debug!(command = handler.kind.name(), "覆盖已注册的命令");
            }
            self.handlers.insert(handler.kind.name(), handler);
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn create(&self, name: &str, peer: Arc<dyn Peer>) -> SawResult<Command> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| SawError::unknown_command(name))?;
        Ok(self.commander.create(handler.kind, peer))
    }

    /// 分发之前做的结构检查
    pub fn valid(&self, payload: &Value) -> bool {
        WireMessage::is_valid(payload)
    }

    pub fn dispatch(
        &self,
        message: WireMessage,
        peer: Arc<dyn Peer>,
        context: &mut C,
    ) -> SawResult<Dispatched> {
        let handler = self
            .handlers
            .get(message.command.as_str())
            .ok_or_else(|| SawError::unknown_command(&message.command))?;
        let mut command = Command::restore(
            handler.kind,
            message.id,
            peer,
            message.state,
            message.code,
        );

        match message.state {
            CommandState::Resulted => {
                command.handle(&message.data);
                let connection = command.peer().connection_id();
                let pending = self
                    .commander
                    .take_matching(message.id, handler.kind, connection);
                let Some(pending) = pending else {
                    warn!(
                        command = command.name(),
                        id = message.id,
                        connection,
                        "收到未知命令的结果, 丢弃"
                    );
                    return Ok(Dispatched::Unsolicited);
                };
                // 结果数据原样交给等待方, 包括未声明的字段
                command.set_data(message.data);
                pending.dispatch_result(&command)?;
                Ok(Dispatched::Resolved)
            }
            CommandState::Running => {
                command.handle(&message.data);
                match handler.handler.as_ref() {
                    Some(execute) => {
                        execute(context, command)?;
                        Ok(Dispatched::Handled)
                    }
                    None => {
                        warn!(command = command.name(), id = message.id, "本端不执行该命令");
                        command.fail(format!("命令 {} 在此端不可执行", command.name()))?;
                        Ok(Dispatched::Refused)
                    }
                }
            }
            CommandState::New => Err(SawError::malformed(format!(
                "命令 {} (id={}) 以NEW状态送达",
                message.command, message.id
            ))),
        }
    }
}
