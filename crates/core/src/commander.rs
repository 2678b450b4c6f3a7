use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::command::{Command, CommandKind};
use crate::errors::{SawError, SawResult};
use crate::protocol::{CommandCode, CommandData};
use crate::transport::{ConnectionId, Peer};

/// 对端送回的命令结果
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Success(CommandData),
    Error(CommandData),
}

impl CommandReply {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandReply::Success(_))
    }

    pub fn data(&self) -> &CommandData {
        match self {
            CommandReply::Success(data) | CommandReply::Error(data) => data,
        }
    }
}

/// 等待中的命令结果, 由调度器恰好解决一次
#[derive(Debug)]
pub struct ResultHandle {
    id: u64,
    kind: CommandKind,
    receiver: oneshot::Receiver<CommandReply>,
}

impl ResultHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub async fn wait(self) -> SawResult<CommandReply> {
        self.receiver
            .await
            .map_err(|_| SawError::CommandAbandoned { id: self.id })
    }

    /// 不阻塞地查看结果
    pub fn try_result(&mut self) -> Option<SawResult<CommandReply>> {
        match self.receiver.try_recv() {
            Ok(reply) => Some(Ok(reply)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(SawError::CommandAbandoned { id: self.id }))
            }
        }
    }
}

/// 发起方本地保存的待决命令, 结果回调不会经过网络
#[derive(Debug)]
pub struct PendingCommand {
    kind: CommandKind,
    connection: ConnectionId,
    responder: oneshot::Sender<CommandReply>,
}

impl PendingCommand {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// 用对端送回的命令解决结果
    pub fn dispatch_result(self, reply: &Command) -> SawResult<()> {
        let reply = match reply.code() {
            CommandCode::Success => CommandReply::Success(reply.data().clone()),
            CommandCode::Error => CommandReply::Error(reply.data().clone()),
            CommandCode::Void => {
                return Err(SawError::InvariantViolation(format!(
                    "命令 {} (id={}) 既不是成功也不是失败",
                    reply.name(),
                    reply.id()
                )));
            }
        };
        if self.responder.send(reply).is_err() {
            debug!(command = self.kind.name(), "结果的接收方已经放弃等待");
        }
        Ok(())
    }
}

/// 分配关联标识并登记待决命令
#[derive(Clone, Default)]
pub struct Commander {
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, PendingCommand>>>,
}

impl Commander {
    pub fn new() -> Self {
        Self::default()
    }

    /// 单调递增, 不会与未完成的命令重复
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn create(&self, kind: CommandKind, peer: Arc<dyn Peer>) -> Command {
        Command::new(kind, self.next_id(), peer)
    }

    /// 登记并发送命令, 发送失败时撤销登记
    pub fn submit(&self, mut command: Command, payload: CommandData) -> SawResult<ResultHandle> {
        let (responder, receiver) = oneshot::channel();
        let id = command.id();
        let kind = command.kind();
        let connection = command.peer().connection_id();
        self.pending.lock().insert(
            id,
            PendingCommand {
                kind,
                connection,
                responder,
            },
        );

        if let Err(e) = command.run(payload) {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        Ok(ResultHandle { id, kind, receiver })
    }

    /// 创建并发送
    pub fn send(
        &self,
        kind: CommandKind,
        peer: Arc<dyn Peer>,
        payload: CommandData,
    ) -> SawResult<ResultHandle> {
        self.submit(self.create(kind, peer), payload)
    }

    /// 取出待决命令; 重复的结果在第一次之后就找不到了
    pub fn take_pending(&self, id: u64) -> Option<PendingCommand> {
        self.pending.lock().remove(&id)
    }

    /// 只有名称和来源连接都一致时才取出, 不符的结果不会消耗待决命令
    pub fn take_matching(
        &self,
        id: u64,
        kind: CommandKind,
        connection: ConnectionId,
    ) -> Option<PendingCommand> {
        let mut pending = self.pending.lock();
        match pending.get(&id) {
            Some(command) if command.kind == kind && command.connection == connection => {
                pending.remove(&id)
            }
            _ => None,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// 放弃发往某个连接的所有待决命令
    pub fn abandon_connection(&self, connection: ConnectionId) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, command| command.connection != connection);
        let abandoned = before - pending.len();
        if abandoned > 0 {
            debug!(connection, abandoned, "连接断开, 放弃待决命令");
        }
        abandoned
    }

    /// 放弃所有待决命令, 等待方会得到 `CommandAbandoned`
    pub fn abandon_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        if count > 0 {
            warn!("放弃 {} 个待决命令", count);
        }
        pending.clear();
        count
    }
}
