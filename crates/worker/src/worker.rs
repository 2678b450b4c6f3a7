use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use saw_core::{
    to_data, Command, CommandHandler, CommandKind, CommandReply, Commander, Dispatcher, Frame,
    Inbound, InboundEvent, Peer, SawError, SawResult, Signal, ThreadResultPayload,
    ThreadRunPayload, WorkerConfig,
};

use crate::application::ApplicationContainer;
use crate::creator::{TaskAnnouncer, TaskCatalog, WorkerThreadCreator};
use crate::linker::ThreadLinker;
use crate::multithreading::ThreadRunner;
use crate::pool::PoolContainer;
use crate::thread::{ThreadStatus, WorkResult};

/// 异步等待的结果回到Worker循环
pub enum WorkerFeedback {
    /// 控制器对 `wadd` 的回复
    Registered(SawResult<CommandReply>),
    /// 控制器分发来的一次运行已经结束
    RunFinished {
        run_id: u64,
        application_id: String,
        unique_id: String,
        status: ThreadStatus,
    },
    /// 所有应用的 `run` 都已返回, 交回它们声明的线程
    ApplicationsFinished {
        failed: usize,
        creator: WorkerThreadCreator,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// 等待控制器的HELLO
    Connecting,
    AwaitingAccept,
    /// 已发送 `wadd`, 等待回复
    Registering,
    Running,
    Stopped,
}

/// 向控制器请求在其他Worker上运行任务
#[derive(Clone)]
pub struct RunRequester {
    commander: Commander,
    peer: Arc<dyn Peer>,
    next_run: Arc<AtomicU64>,
    waiting: Arc<Mutex<HashMap<u64, oneshot::Sender<WorkResult>>>>,
}

impl RunRequester {
    pub fn new(commander: Commander, peer: Arc<dyn Peer>) -> Self {
        Self {
            commander,
            peer,
            next_run: Arc::new(AtomicU64::new(0)),
            waiting: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 发送 `trun`, 结果随之后的 `tres` 送达; 控制器拒绝时以失败送达
    pub fn request(
        &self,
        application_id: &str,
        task: &str,
        arguments: Vec<Value>,
    ) -> SawResult<oneshot::Receiver<WorkResult>> {
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
        let payload = ThreadRunPayload {
            run_id,
            application_id: application_id.to_string(),
            unique_id: task.to_string(),
            arguments,
        };
        let (responder, receiver) = oneshot::channel();
        self.waiting.lock().insert(run_id, responder);

        let sent = to_data(&payload).and_then(|data| {
            self.commander
                .send(CommandKind::ThreadRun, self.peer.clone(), data)
        });
        let handle = match sent {
            Ok(handle) => handle,
            Err(e) => {
                self.waiting.lock().remove(&run_id);
                return Err(e);
            }
        };
        info!(run_id, task, "已请求远程运行");

        let waiting = self.waiting.clone();
        tokio::spawn(async move {
            let reason = match handle.wait().await {
                Ok(CommandReply::Success(_)) => {
                    debug!(run_id, "控制器已接受运行请求");
                    return;
                }
                Ok(CommandReply::Error(data)) => data
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("控制器拒绝了运行请求")
                    .to_string(),
                Err(e) => e.to_string(),
            };
            if let Some(responder) = waiting.lock().remove(&run_id) {
                warn!(run_id, reason = %reason, "远程运行请求失败");
                let _ = responder.send(Err(reason));
            }
        });
        Ok(receiver)
    }

    fn resolve(&self, run_id: u64, result: WorkResult) -> bool {
        match self.waiting.lock().remove(&run_id) {
            Some(responder) => {
                let _ = responder.send(result);
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.waiting.lock().len()
    }

    fn abandon_all(&self) {
        self.waiting.lock().clear();
    }
}

/// 命令处理函数操作的Worker状态
pub struct WorkerState {
    catalog: TaskCatalog,
    runs: PoolContainer,
    linker: ThreadLinker,
    requester: RunRequester,
    feedback: mpsc::UnboundedSender<WorkerFeedback>,
    stop_requested: bool,
}

impl WorkerState {
    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    pub fn runs(&self) -> &PoolContainer {
        &self.runs
    }

    pub fn linker(&self) -> &ThreadLinker {
        &self.linker
    }
}

/// 同一个任务可以同时有多次运行, 池内标识带上运行标识
fn run_key(unique_id: &str, run_id: u64) -> String {
    format!("{unique_id}#{run_id}")
}

fn worker_delete(state: &mut WorkerState, mut command: Command) -> SawResult<()> {
    info!("控制器要求Worker退出");
    state.stop_requested = true;
    command.success()
}

fn thread_run(state: &mut WorkerState, mut command: Command) -> SawResult<()> {
    let payload: ThreadRunPayload = match command.payload() {
        Ok(payload) => payload,
        Err(e) => return command.fail(e.to_string()),
    };
    let Some(declared) = state.catalog.get(&payload.unique_id) else {
        warn!(run_id = payload.run_id, task = %payload.unique_id, "未知的任务");
        return command.fail(format!("未知的任务: {}", payload.unique_id));
    };

    let key = run_key(&payload.unique_id, payload.run_id);
    let pool = state.runs.pool(&payload.application_id);
    let thread = match pool.create(&key, declared.work(), payload.arguments) {
        Ok(thread) => thread,
        Err(e) => return command.fail(e.to_string()),
    };
    if let Err(e) = thread.start() {
        pool.forget(&key);
        return command.fail(e.to_string());
    }
    state.linker.link_threads(&declared, &thread);
    info!(run_id = payload.run_id, task = %payload.unique_id, "开始执行运行");

    let mut handle = thread.handle();
    let feedback = state.feedback.clone();
    let run_id = payload.run_id;
    let application_id = payload.application_id;
    let unique_id = payload.unique_id;
    tokio::spawn(async move {
        let status = handle.finished().await;
        let _ = feedback.send(WorkerFeedback::RunFinished {
            run_id,
            application_id,
            unique_id,
            status,
        });
    });
    command.success()
}

fn thread_result(state: &mut WorkerState, mut command: Command) -> SawResult<()> {
    let payload: ThreadResultPayload = match command.payload() {
        Ok(payload) => payload,
        Err(e) => return command.fail(e.to_string()),
    };
    let result = if payload.success {
        Ok(payload.result)
    } else {
        Err(match payload.result {
            Value::String(reason) => reason,
            other => other.to_string(),
        })
    };
    if state.requester.resolve(payload.run_id, result) {
        debug!(run_id = payload.run_id, "远程运行结果已送达");
        command.success()
    } else {
        warn!(run_id = payload.run_id, "收到未请求的运行结果");
        command.fail(
            SawError::UnknownRun {
                run_id: payload.run_id,
            }
            .to_string(),
        )
    }
}

/// Worker核心
///
/// 连接上的消息、异步回复和运行结束事件都在拥有它的循环中处理。
/// 应用在单独的任务中运行, 通过同一个 `Commander` 登记任务。
pub struct WorkerCore {
    dispatcher: Dispatcher<WorkerState>,
    state: WorkerState,
    peer: Arc<dyn Peer>,
    applications: Arc<ApplicationContainer>,
    phase: WorkerPhase,
    sync_timeout: Duration,
    announce_retry_limit: u32,
    applications_task: Option<JoinHandle<()>>,
    local: Option<WorkerThreadCreator>,
}

impl WorkerCore {
    pub fn new(
        config: &WorkerConfig,
        applications: ApplicationContainer,
        peer: Arc<dyn Peer>,
        feedback: mpsc::UnboundedSender<WorkerFeedback>,
    ) -> Self {
        let commander = Commander::new();
        let mut dispatcher = Dispatcher::new(commander.clone());
        dispatcher.add([
            CommandHandler::passive(CommandKind::WorkerAdd),
            CommandHandler::new(CommandKind::WorkerDelete, worker_delete),
            CommandHandler::passive(CommandKind::ThreadKnow),
            CommandHandler::new(CommandKind::ThreadRun, thread_run),
            CommandHandler::new(CommandKind::ThreadResult, thread_result),
        ]);

        Self {
            dispatcher,
            state: WorkerState {
                catalog: TaskCatalog::new(),
                runs: PoolContainer::new(),
                linker: ThreadLinker::new(),
                requester: RunRequester::new(commander, peer.clone()),
                feedback,
                stop_requested: false,
            },
            peer,
            applications: Arc::new(applications),
            phase: WorkerPhase::Connecting,
            sync_timeout: Duration::from_millis(config.sync_timeout_ms),
            announce_retry_limit: config.announce_retry_limit,
            applications_task: None,
            local: None,
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == WorkerPhase::Stopped
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn commander(&self) -> &Commander {
        self.dispatcher.commander()
    }

    pub fn requester(&self) -> RunRequester {
        self.state.requester.clone()
    }

    /// 应用声明的线程, 在应用全部返回之后才可用
    pub fn local_threads(&self) -> Option<&WorkerThreadCreator> {
        self.local.as_ref()
    }

    pub fn on_inbound(&mut self, inbound: Inbound) {
        match inbound.event {
            InboundEvent::Message(value) => self.on_message(value),
            InboundEvent::Closed => {
                info!("与控制器的连接已断开");
                self.stop();
            }
        }
    }

    pub fn on_message(&mut self, value: Value) {
        if self.is_stopped() {
            return;
        }
        if value.is_object() && !self.dispatcher.valid(&value) {
            warn!("命令信封不完整");
            self.peer.send(Frame::Signal(Signal::Invalid));
            return;
        }
        let frame = match Frame::from_value(value) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("无效消息: {}", e);
                self.peer.send(Frame::Signal(Signal::Invalid));
                return;
            }
        };

        match frame {
            Frame::Signal(Signal::Hello) => {
                debug!("收到控制器问候");
                self.peer.send(Frame::Signal(Signal::Hello));
                if self.phase == WorkerPhase::Connecting {
                    self.phase = WorkerPhase::AwaitingAccept;
                }
            }
            Frame::Signal(Signal::Accept) => {
                if self.phase == WorkerPhase::AwaitingAccept {
                    self.register();
                } else {
                    warn!(phase = ?self.phase, "忽略多余的ACCEPT");
                }
            }
            Frame::Signal(Signal::Bye) => {
                info!("控制器告别");
                self.stop();
            }
            Frame::Signal(Signal::Invalid) => warn!("控制器报告收到了无效消息"),
            Frame::Command(message) => {
                if !matches!(self.phase, WorkerPhase::Registering | WorkerPhase::Running) {
                    warn!(command = %message.command, "注册之前收到命令");
                    self.peer.send(Frame::Signal(Signal::Invalid));
                    return;
                }
                match self
                    .dispatcher
                    .dispatch(message, self.peer.clone(), &mut self.state)
                {
                    Ok(outcome) => debug!(?outcome, "命令已处理"),
                    Err(e) if e.is_fatal() => error!("命令流程终止: {}", e),
                    Err(e @ SawError::UnknownCommand { .. }) => {
                        warn!("{}", e);
                        self.peer.send(Frame::Signal(Signal::Invalid));
                    }
                    Err(e) => warn!("命令处理失败: {}", e),
                }
                if self.state.stop_requested {
                    self.stop();
                }
            }
        }
    }

    fn register(&mut self) {
        match self
            .commander()
            .send(CommandKind::WorkerAdd, self.peer.clone(), Default::default())
        {
            Ok(handle) => {
                info!("向控制器注册Worker");
                self.phase = WorkerPhase::Registering;
                let feedback = self.state.feedback.clone();
                tokio::spawn(async move {
                    let reply = handle.wait().await;
                    let _ = feedback.send(WorkerFeedback::Registered(reply));
                });
            }
            Err(e) => {
                error!("发送wadd失败: {}", e);
                self.stop();
            }
        }
    }

    pub fn on_feedback(&mut self, feedback: WorkerFeedback) {
        match feedback {
            WorkerFeedback::Registered(reply) => {
                if self.phase != WorkerPhase::Registering {
                    return;
                }
                match reply {
                    Ok(CommandReply::Success(_)) => {
                        info!("Worker已注册");
                        self.phase = WorkerPhase::Running;
                        self.start_applications();
                    }
                    Ok(CommandReply::Error(data)) => {
                        error!(error = ?data.get("error"), "控制器拒绝了注册");
                        self.stop();
                    }
                    Err(e) => {
                        error!("注册没有得到回复: {}", e);
                        self.stop();
                    }
                }
            }
            WorkerFeedback::RunFinished {
                run_id,
                application_id,
                unique_id,
                status,
            } => self.report_run(run_id, application_id, unique_id, status),
            WorkerFeedback::ApplicationsFinished { failed, creator } => {
                info!(
                    failed,
                    threads = creator.catalog().names().len(),
                    "应用已全部返回"
                );
                self.local = Some(creator);
            }
        }
    }

    fn start_applications(&mut self) {
        let creator = WorkerThreadCreator::new(
            ThreadRunner::new(self.sync_timeout),
            TaskAnnouncer::new(
                self.commander().clone(),
                self.peer.clone(),
                self.announce_retry_limit,
            ),
            self.state.catalog.clone(),
        );
        let applications = self.applications.clone();
        let feedback = self.state.feedback.clone();
        info!(applications = applications.len(), "启动应用");
        self.applications_task = Some(tokio::spawn(async move {
            let mut creator = creator;
            let failed = applications.run_all(&mut creator).await;
            let _ = feedback.send(WorkerFeedback::ApplicationsFinished { failed, creator });
        }));
    }

    fn report_run(
        &mut self,
        run_id: u64,
        application_id: String,
        unique_id: String,
        status: ThreadStatus,
    ) {
        let key = run_key(&unique_id, run_id);
        let finished = self.state.runs.pool(&application_id).forget(&key);
        if let (Some(declared), Some(finished)) = (self.state.catalog.get(&unique_id), finished) {
            let current = self.state.linker.get_linked_thread(&declared);
            if current.is_ok_and(|linked| Arc::ptr_eq(&linked, &finished)) {
                self.state.linker.unlink_threads(&declared);
            }
        }

        let (success, result) = match status {
            ThreadStatus::Completed(value) => (true, value),
            ThreadStatus::Failed(reason) => (false, Value::String(reason)),
            other => (false, Value::String(format!("线程以 {} 状态结束", other.name()))),
        };
        info!(run_id, task = %unique_id, success, "运行已结束");
        let payload = ThreadResultPayload {
            run_id,
            application_id,
            unique_id,
            success,
            result,
        };
        let sent = to_data(&payload).and_then(|data| {
            self.commander()
                .send(CommandKind::ThreadResult, self.peer.clone(), data)
        });
        if let Err(e) = sent {
            warn!(run_id, "发送运行结果失败: {}", e);
        }
    }

    /// 请求控制器在某个知道该任务的Worker上运行它
    pub fn request_run(
        &self,
        application_id: &str,
        task: &str,
        arguments: Vec<Value>,
    ) -> SawResult<oneshot::Receiver<WorkResult>> {
        if self.phase != WorkerPhase::Running {
            return Err(SawError::internal(format!(
                "Worker处于 {:?} 阶段, 不能请求运行",
                self.phase
            )));
        }
        self.state.requester.request(application_id, task, arguments)
    }

    /// 主动退出: 注销并告别, 然后停止
    pub fn shutdown(&mut self) {
        if self.is_stopped() {
            return;
        }
        info!("Worker正在停止");
        if matches!(self.phase, WorkerPhase::Registering | WorkerPhase::Running) {
            if let Err(e) =
                self.commander()
                    .send(CommandKind::WorkerDelete, self.peer.clone(), Default::default())
            {
                warn!("发送wdel失败: {}", e);
            }
        }
        self.peer.send(Frame::Signal(Signal::Bye));
        self.stop();
    }

    fn stop(&mut self) {
        if self.is_stopped() {
            return;
        }
        self.phase = WorkerPhase::Stopped;
        if let Some(task) = self.applications_task.take() {
            task.abort();
        }
        self.state.runs.clear();
        self.state.requester.abandon_all();
        self.commander().abandon_all();
        self.peer.close();
        info!("Worker已停止");
    }
}
