use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use saw_core::{
    to_data, Command, CommandHandler, CommandKind, CommandReply, Commander, ConnectionId,
    ControllerConfig, Dispatcher, Frame, Inbound, InboundEvent, Peer, SawError, SawResult,
    Signal, ThreadKnowPayload, ThreadResultPayload, ThreadRunPayload,
};

use crate::balancer::WorkerBalancer;
use crate::distributor::{
    Assignment, FinishedRun, RunOrigin, RunOutcome, RunRequest, ThreadDistributor,
};

/// 异步等待的结果回到控制器循环
#[derive(Debug)]
pub enum Feedback {
    /// Worker对 `trun` 的回复
    DispatchReply {
        run_id: u64,
        reply: SawResult<CommandReply>,
    },
}

struct PeerSession {
    peer: Arc<dyn Peer>,
    accepted: bool,
}

/// 命令处理函数操作的控制器状态
pub struct ControllerState {
    distributor: ThreadDistributor,
    sessions: HashMap<ConnectionId, PeerSession>,
    commander: Commander,
}

impl ControllerState {
    pub fn distributor(&self) -> &ThreadDistributor {
        &self.distributor
    }

    fn delete_worker(&mut self, connection: ConnectionId) {
        if self.distributor.on_worker_deleted(connection) {
            self.commander.abandon_connection(connection);
        }
    }

    /// 把结束的运行交还给来源
    fn forward(&mut self, finished: FinishedRun) {
        match finished.origin {
            RunOrigin::Local(responder) => {
                if responder.send(finished.outcome).is_err() {
                    debug!(run_id = finished.run_id, "本地调用方已放弃等待结果");
                }
            }
            RunOrigin::Peer { connection, run_id } => {
                let Some(session) = self.sessions.get(&connection) else {
                    warn!(connection, run_id, "请求方已断开, 丢弃运行结果");
                    return;
                };
                let (success, result) = finished.outcome.to_result();
                let payload = ThreadResultPayload {
                    run_id,
                    application_id: finished.application_id,
                    unique_id: finished.task,
                    success,
                    result,
                };
                let sent = to_data(&payload).and_then(|data| {
                    self.commander
                        .send(CommandKind::ThreadResult, session.peer.clone(), data)
                });
                match sent {
                    Ok(handle) => {
                        debug!(connection, run_id, id = handle.id(), "运行结果已转发给请求方")
                    }
                    Err(e) => warn!(connection, run_id, "转发运行结果失败: {}", e),
                }
            }
        }
    }
}

fn worker_add(state: &mut ControllerState, mut command: Command) -> SawResult<()> {
    state
        .distributor
        .balancer_mut()
        .on_worker_announce(command.peer().clone());
    command.success()
}

fn worker_delete(state: &mut ControllerState, mut command: Command) -> SawResult<()> {
    state.delete_worker(command.peer().connection_id());
    command.success()
}

fn thread_know(state: &mut ControllerState, mut command: Command) -> SawResult<()> {
    let payload: ThreadKnowPayload = match command.payload() {
        Ok(payload) => payload,
        Err(e) => return command.fail(e.to_string()),
    };
    let connection = command.peer().connection_id();
    match state.distributor.t_add(connection, &payload.name) {
        Ok(_) => command.success(),
        Err(e) => {
            warn!(connection, task = %payload.name, "任务登记失败: {}", e);
            command.fail(e.to_string())
        }
    }
}

fn thread_run(state: &mut ControllerState, mut command: Command) -> SawResult<()> {
    let payload: ThreadRunPayload = match command.payload() {
        Ok(payload) => payload,
        Err(e) => return command.fail(e.to_string()),
    };
    let connection = command.peer().connection_id();
    if !state.distributor.balancer().contains(connection) {
        return command.fail(SawError::WorkerNotFound { connection }.to_string());
    }
    info!(
        connection,
        run_id = payload.run_id,
        task = %payload.unique_id,
        "收到Worker的运行请求"
    );
    state.distributor.enqueue(RunRequest::new(
        payload.application_id,
        payload.unique_id,
        payload.arguments,
        RunOrigin::Peer {
            connection,
            run_id: payload.run_id,
        },
    ));
    command.success()
}

fn thread_result(state: &mut ControllerState, mut command: Command) -> SawResult<()> {
    let payload: ThreadResultPayload = match command.payload() {
        Ok(payload) => payload,
        Err(e) => return command.fail(e.to_string()),
    };
    let connection = command.peer().connection_id();
    let outcome = if payload.success {
        RunOutcome::Completed(payload.result)
    } else {
        RunOutcome::Failed(match payload.result {
            Value::String(reason) => reason,
            other => other.to_string(),
        })
    };
    match state.distributor.t_res(payload.run_id, connection, outcome) {
        Ok(finished) => {
            state.forward(finished);
            command.success()
        }
        Err(e) => {
            warn!(connection, run_id = payload.run_id, "丢弃运行结果: {}", e);
            command.fail(e.to_string())
        }
    }
}

/// 控制器核心
///
/// 所有状态都由拥有它的单个循环修改: 处理入站消息、异步回复和定时的 `work`。
pub struct ControllerCore {
    dispatcher: Dispatcher<ControllerState>,
    state: ControllerState,
    feedback: mpsc::UnboundedSender<Feedback>,
    tick_interval: Duration,
}

impl ControllerCore {
    pub fn new(config: &ControllerConfig, feedback: mpsc::UnboundedSender<Feedback>) -> Self {
        let commander = Commander::new();
        let mut dispatcher = Dispatcher::new(commander.clone());
        dispatcher.add([
            CommandHandler::new(CommandKind::WorkerAdd, worker_add),
            CommandHandler::new(CommandKind::WorkerDelete, worker_delete),
            CommandHandler::new(CommandKind::ThreadKnow, thread_know),
            CommandHandler::new(CommandKind::ThreadRun, thread_run),
            CommandHandler::new(CommandKind::ThreadResult, thread_result),
        ]);

        let distributor = ThreadDistributor::new(
            WorkerBalancer::new(config.worker_max_count),
            Duration::from_millis(config.dispatch_timeout_ms),
        );
        Self {
            dispatcher,
            state: ControllerState {
                distributor,
                sessions: HashMap::new(),
                commander,
            },
            feedback,
            tick_interval: Duration::from_millis(config.tick_interval_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn distributor(&self) -> &ThreadDistributor {
        &self.state.distributor
    }

    pub fn commander(&self) -> &Commander {
        self.dispatcher.commander()
    }

    pub fn connection_count(&self) -> usize {
        self.state.sessions.len()
    }

    /// 新连接: 记录会话并发出问候
    pub fn on_connect(&mut self, peer: Arc<dyn Peer>) {
        let connection = peer.connection_id();
        info!(connection, address = peer.address(), "新的Worker连接");
        if !peer.send(Frame::Signal(Signal::Hello)) {
            warn!(connection, "发送HELLO失败");
        }
        self.state.sessions.insert(
            connection,
            PeerSession {
                peer,
                accepted: false,
            },
        );
    }

    pub fn on_inbound(&mut self, inbound: Inbound) {
        match inbound.event {
            InboundEvent::Message(value) => self.on_message(inbound.connection, value),
            InboundEvent::Closed => self.on_disconnect(inbound.connection),
        }
    }

    pub fn on_message(&mut self, connection: ConnectionId, value: Value) {
        let Some(session) = self.state.sessions.get(&connection) else {
            warn!(connection, "收到未知连接的消息");
            return;
        };
        let peer = session.peer.clone();
        let accepted = session.accepted;

        if value.is_object() && !self.dispatcher.valid(&value) {
            warn!(connection, "命令信封不完整");
            peer.send(Frame::Signal(Signal::Invalid));
            return;
        }
        let frame = match Frame::from_value(value) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection, "无效消息: {}", e);
                peer.send(Frame::Signal(Signal::Invalid));
                return;
            }
        };

        match frame {
            Frame::Signal(Signal::Hello) => {
                if let Some(session) = self.state.sessions.get_mut(&connection) {
                    session.accepted = true;
                }
                debug!(connection, "握手完成");
                peer.send(Frame::Signal(Signal::Accept));
            }
            Frame::Signal(Signal::Bye) => {
                info!(connection, "Worker告别");
                self.on_disconnect(connection);
                peer.close();
            }
            Frame::Signal(Signal::Invalid) => {
                warn!(connection, "Worker报告收到了无效消息");
            }
            Frame::Signal(Signal::Accept) => {
                warn!(connection, "控制器不应收到ACCEPT");
            }
            Frame::Command(message) => {
                if !accepted {
                    warn!(connection, command = %message.command, "握手完成前收到命令");
                    peer.send(Frame::Signal(Signal::Invalid));
                    return;
                }
                match self.dispatcher.dispatch(message, peer.clone(), &mut self.state) {
                    Ok(outcome) => debug!(connection, ?outcome, "命令已处理"),
                    Err(e) if e.is_fatal() => error!(connection, "命令流程终止: {}", e),
                    Err(e @ SawError::UnknownCommand { .. }) => {
                        warn!(connection, "{}", e);
                        peer.send(Frame::Signal(Signal::Invalid));
                    }
                    Err(e) => warn!(connection, "命令处理失败: {}", e),
                }
            }
        }
    }

    /// 连接断开与 `wdel` 的处理相同
    pub fn on_disconnect(&mut self, connection: ConnectionId) {
        if self.state.sessions.remove(&connection).is_some() {
            info!(connection, "连接已关闭");
        }
        self.state.delete_worker(connection);
    }

    pub fn on_feedback(&mut self, feedback: Feedback) {
        match feedback {
            Feedback::DispatchReply { run_id, reply } => match reply {
                Ok(CommandReply::Success(_)) => debug!(run_id, "Worker已接受运行"),
                Ok(CommandReply::Error(data)) => {
                    let reason = data
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("Worker拒绝了运行请求")
                        .to_string();
                    warn!(run_id, reason = %reason, "Worker拒绝了运行");
                    if let Ok(finished) = self.state.distributor.fail_run(run_id, reason) {
                        self.state.forward(finished);
                    }
                }
                // 连接断开时由孤儿处理接管
                Err(e) => debug!(run_id, "运行请求没有得到回复: {}", e),
            },
        }
    }

    /// 控制器进程内提交运行, 结果通过返回的接收端送达
    pub fn submit_run(
        &mut self,
        application_id: impl Into<String>,
        task: impl Into<String>,
        arguments: Vec<Value>,
    ) -> oneshot::Receiver<RunOutcome> {
        let (responder, receiver) = oneshot::channel();
        self.state.distributor.enqueue(RunRequest::new(
            application_id,
            task,
            arguments,
            RunOrigin::Local(responder),
        ));
        receiver
    }

    /// 一次循环: 准入、孤儿、分发和过期
    pub fn work(&mut self, now: Instant) {
        let report = self.state.distributor.work(now);
        for finished in report.finished {
            self.state.forward(finished);
        }
        for assignment in report.assignments {
            self.dispatch_assignment(assignment);
        }
    }

    fn dispatch_assignment(&mut self, assignment: Assignment) {
        let Assignment {
            run_id,
            peer,
            payload,
        } = assignment;
        let connection = peer.connection_id();
        let sent = to_data(&payload).and_then(|data| {
            self.state
                .commander
                .send(CommandKind::ThreadRun, peer, data)
        });
        match sent {
            Ok(handle) => {
                info!(run_id, connection, task = %payload.unique_id, "运行已分发");
                let feedback = self.feedback.clone();
                tokio::spawn(async move {
                    let reply = handle.wait().await;
                    let _ = feedback.send(Feedback::DispatchReply { run_id, reply });
                });
            }
            Err(e) => {
                warn!(run_id, connection, "分发失败: {}", e);
                if let Ok(finished) = self.state.distributor.fail_run(run_id, e.to_string()) {
                    self.state.forward(finished);
                }
            }
        }
    }

    /// 停止: 通知所有连接并结束在途运行
    pub fn shutdown(&mut self) {
        info!(connections = self.state.sessions.len(), "控制器正在停止");
        for finished in self.state.distributor.drain() {
            if let RunOrigin::Local(responder) = finished.origin {
                let _ = responder.send(finished.outcome);
            }
        }
        for (_, session) in self.state.sessions.drain() {
            session.peer.send(Frame::Signal(Signal::Bye));
            session.peer.close();
        }
        self.state.commander.abandon_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saw_core::{CommandCode, CommandData, CommandState, MemoryPeer, WireMessage};
    use serde_json::json;

    fn core() -> (ControllerCore, mpsc::UnboundedReceiver<Feedback>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ControllerConfig {
            worker_max_count: 2,
            ..ControllerConfig::default()
        };
        (ControllerCore::new(&config, tx), rx)
    }

    fn request(command: &str, id: u64, data: Value) -> Value {
        json!({"command": command, "state": 1, "id": id, "code": 0, "data": data})
    }

    fn next_frame(frames: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
        frames.try_recv().unwrap()
    }

    #[test]
    fn test_handshake_greets_and_accepts() {
        let (mut core, _feedback) = core();
        let (peer, mut frames) = MemoryPeer::new(1, "memory");
        core.on_connect(peer);
        assert_eq!(next_frame(&mut frames), Frame::Signal(Signal::Hello));

        core.on_message(1, json!("HELLO"));
        assert_eq!(next_frame(&mut frames), Frame::Signal(Signal::Accept));
    }

    #[test]
    fn test_command_before_handshake_is_invalid() {
        let (mut core, _feedback) = core();
        let (peer, mut frames) = MemoryPeer::new(1, "memory");
        core.on_connect(peer);
        next_frame(&mut frames);

        core.on_message(1, request("wadd", 1, json!({})));
        assert_eq!(next_frame(&mut frames), Frame::Signal(Signal::Invalid));
        assert_eq!(core.distributor().balancer().worker_count(), 0);
    }

    #[test]
    fn test_malformed_and_unknown_messages_are_answered_invalid() {
        let (mut core, _feedback) = core();
        let (peer, mut frames) = MemoryPeer::new(1, "memory");
        core.on_connect(peer);
        core.on_message(1, json!("HELLO"));
        next_frame(&mut frames);
        next_frame(&mut frames);

        core.on_message(1, Value::Null);
        assert_eq!(next_frame(&mut frames), Frame::Signal(Signal::Invalid));
        core.on_message(1, json!({"command": "wadd"}));
        assert_eq!(next_frame(&mut frames), Frame::Signal(Signal::Invalid));
        core.on_message(1, request("nope", 2, json!({})));
        assert_eq!(next_frame(&mut frames), Frame::Signal(Signal::Invalid));
        assert_eq!(core.connection_count(), 1);
    }

    #[test]
    fn test_tadd_from_unregistered_worker_is_an_error_reply() {
        let (mut core, _feedback) = core();
        let (peer, mut frames) = MemoryPeer::new(1, "memory");
        core.on_connect(peer);
        core.on_message(1, json!("HELLO"));
        next_frame(&mut frames);
        next_frame(&mut frames);

        core.on_message(1, request("tadd", 4, json!({"name": "sum"})));
        match next_frame(&mut frames) {
            Frame::Command(WireMessage {
                state, code, id, ..
            }) => {
                assert_eq!(state, CommandState::Resulted);
                assert_eq!(code, CommandCode::Error);
                assert_eq!(id, 4);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_rejection_fails_local_run() {
        let (mut core, mut feedback) = core();
        let (peer, mut frames) = MemoryPeer::new(1, "memory");
        core.on_connect(peer);
        core.on_message(1, json!("HELLO"));
        core.on_message(1, request("wadd", 1, json!({})));
        core.on_message(1, request("tadd", 2, json!({"name": "sum"})));
        while frames.try_recv().is_ok() {}

        let outcome = core.submit_run("app1", "sum", Vec::new());
        core.work(Instant::now());
        let Frame::Command(trun) = next_frame(&mut frames) else {
            panic!("expected trun");
        };
        assert_eq!(trun.command, "trun");

        let mut data = CommandData::new();
        data.insert("error".to_string(), json!("unknown task"));
        core.on_message(
            1,
            json!({"command": "trun", "state": 2, "id": trun.id, "code": 2, "data": data}),
        );
        let reply = feedback.recv().await.unwrap();
        core.on_feedback(reply);

        assert_eq!(
            outcome.await.unwrap(),
            RunOutcome::Failed("unknown task".to_string())
        );
        assert_eq!(core.distributor().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_says_bye_and_resolves_local_runs() {
        let (mut core, _feedback) = core();
        let (peer, mut frames) = MemoryPeer::new(1, "memory");
        core.on_connect(peer.clone());
        next_frame(&mut frames);

        let outcome = core.submit_run("app1", "sum", Vec::new());
        core.shutdown();

        assert_eq!(next_frame(&mut frames), Frame::Signal(Signal::Bye));
        assert!(peer.is_closed());
        assert!(matches!(outcome.await.unwrap(), RunOutcome::Rejected(_)));
    }
}
