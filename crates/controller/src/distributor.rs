use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use saw_core::{ConnectionId, Peer, SawError, SawResult, ThreadRunPayload};

use crate::balancer::WorkerBalancer;

/// 一次运行的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Value),
    Failed(String),
    /// 执行运行的Worker在结果返回前被删除
    Orphaned,
    /// 没有被任何Worker接受
    Rejected(String),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    /// 转换成 `tres` 中的 `success` 与 `result`
    pub fn to_result(&self) -> (bool, Value) {
        match self {
            RunOutcome::Completed(value) => (true, value.clone()),
            RunOutcome::Failed(reason) => (false, Value::String(reason.clone())),
            RunOutcome::Orphaned => (false, Value::String("执行运行的Worker已断开".to_string())),
            RunOutcome::Rejected(reason) => (false, Value::String(reason.clone())),
        }
    }
}

/// 运行请求的来源, 结果最终交还给它
#[derive(Debug)]
pub enum RunOrigin {
    /// 由某个Worker通过 `trun` 请求, `run_id` 是请求方自己的编号
    Peer {
        connection: ConnectionId,
        run_id: u64,
    },
    /// 控制器进程内提交
    Local(oneshot::Sender<RunOutcome>),
}

impl RunOrigin {
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            RunOrigin::Peer { connection, .. } => Some(*connection),
            RunOrigin::Local(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct RunRequest {
    pub application_id: String,
    /// 要运行的任务, 也就是线程唯一标识
    pub task: String,
    pub arguments: Vec<Value>,
    pub origin: RunOrigin,
    pub received_at: Instant,
}

impl RunRequest {
    pub fn new(
        application_id: impl Into<String>,
        task: impl Into<String>,
        arguments: Vec<Value>,
        origin: RunOrigin,
    ) -> Self {
        Self {
            application_id: application_id.into(),
            task: task.into(),
            arguments,
            origin,
            received_at: Instant::now(),
        }
    }
}

/// 已分发运行的关联记录
#[derive(Debug)]
pub struct RunCorrelation {
    pub run_id: u64,
    pub connection: ConnectionId,
    pub application_id: String,
    pub task: String,
    pub origin: RunOrigin,
    pub dispatched_at: DateTime<Utc>,
}

impl RunCorrelation {
    /// 从分发到 `now` 经过的时间
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.dispatched_at)
    }
}

/// 一次分发: 控制器据此向Worker发送 `trun`
pub struct Assignment {
    pub run_id: u64,
    pub peer: Arc<dyn Peer>,
    pub payload: ThreadRunPayload,
}

/// 已结束的运行, 等待交还给来源
#[derive(Debug)]
pub struct FinishedRun {
    pub run_id: u64,
    pub application_id: String,
    pub task: String,
    pub origin: RunOrigin,
    pub outcome: RunOutcome,
}

#[derive(Default)]
pub struct TickReport {
    pub activated: Vec<ConnectionId>,
    pub assignments: Vec<Assignment>,
    pub finished: Vec<FinishedRun>,
}

/// 运行关联表与积压队列
pub struct ThreadDistributor {
    balancer: WorkerBalancer,
    runs: HashMap<u64, RunCorrelation>,
    backlog: VecDeque<RunRequest>,
    orphaned: Vec<RunCorrelation>,
    next_run_id: u64,
    dispatch_timeout: Duration,
}

impl ThreadDistributor {
    pub fn new(balancer: WorkerBalancer, dispatch_timeout: Duration) -> Self {
        Self {
            balancer,
            runs: HashMap::new(),
            backlog: VecDeque::new(),
            orphaned: Vec::new(),
            next_run_id: 0,
            dispatch_timeout,
        }
    }

    pub fn balancer(&self) -> &WorkerBalancer {
        &self.balancer
    }

    pub fn balancer_mut(&mut self) -> &mut WorkerBalancer {
        &mut self.balancer
    }

    pub fn t_add(&mut self, connection: ConnectionId, task: &str) -> SawResult<bool> {
        self.balancer.on_task_known(connection, task)
    }

    /// 记录一次已分发的运行
    pub fn t_run(
        &mut self,
        run_id: u64,
        connection: ConnectionId,
        request: RunRequest,
    ) -> SawResult<()> {
        if self.runs.contains_key(&run_id) {
            return Err(SawError::DuplicateRunId { run_id });
        }
        self.balancer.begin_run(connection);
        self.runs.insert(
            run_id,
            RunCorrelation {
                run_id,
                connection,
                application_id: request.application_id,
                task: request.task,
                origin: request.origin,
                dispatched_at: Utc::now(),
            },
        );
        debug!(run_id, connection, "运行已记录");
        Ok(())
    }

    /// 匹配运行结果, 成功时移除关联记录
    ///
    /// 只接受运行所分发到的那个Worker送回的结果。
    pub fn t_res(
        &mut self,
        run_id: u64,
        connection: ConnectionId,
        outcome: RunOutcome,
    ) -> SawResult<FinishedRun> {
        match self.runs.get(&run_id) {
            Some(run) if run.connection == connection => {}
            Some(run) => {
                warn!(
                    run_id,
                    expected = run.connection,
                    connection,
                    "运行结果来自错误的Worker"
                );
                return Err(SawError::UnknownRun { run_id });
            }
            None => return Err(SawError::UnknownRun { run_id }),
        }
        self.finish(run_id, outcome)
            .ok_or(SawError::UnknownRun { run_id })
    }

    /// 不经过Worker结果直接结束一次运行, 例如Worker拒绝或发送失败
    pub fn fail_run(&mut self, run_id: u64, reason: impl Into<String>) -> SawResult<FinishedRun> {
        self.finish(run_id, RunOutcome::Failed(reason.into()))
            .ok_or(SawError::UnknownRun { run_id })
    }

    fn finish(&mut self, run_id: u64, outcome: RunOutcome) -> Option<FinishedRun> {
        let run = self.runs.remove(&run_id)?;
        self.balancer.end_run(run.connection);
        info!(
            run_id,
            connection = run.connection,
            task = %run.task,
            success = outcome.is_success(),
            elapsed_ms = run.elapsed(Utc::now()).num_milliseconds(),
            "运行已结束"
        );
        Some(FinishedRun {
            run_id,
            application_id: run.application_id,
            task: run.task,
            origin: run.origin,
            outcome,
        })
    }

    pub fn enqueue(&mut self, request: RunRequest) {
        debug!(task = %request.task, backlog = self.backlog.len() + 1, "运行请求进入积压队列");
        self.backlog.push_back(request);
    }

    /// 删除Worker: 清理注册表, 其在途运行在下一次 `work` 时作为孤儿结束
    pub fn on_worker_deleted(&mut self, connection: ConnectionId) -> bool {
        let removed = self.balancer.on_worker_disconnect(connection).is_some();

        let orphaned: Vec<u64> = self
            .runs
            .values()
            .filter(|run| run.connection == connection)
            .map(|run| run.run_id)
            .collect();
        for run_id in orphaned {
            if let Some(run) = self.runs.remove(&run_id) {
                warn!(run_id, connection, task = %run.task, "运行成为孤儿");
                self.orphaned.push(run);
            }
        }

        // 来源已经不在了, 积压的请求没有交还对象
        let before = self.backlog.len();
        self.backlog
            .retain(|request| request.origin.connection() != Some(connection));
        if self.backlog.len() < before {
            debug!(connection, dropped = before - self.backlog.len(), "丢弃已断开Worker的积压请求");
        }
        removed
    }

    /// 控制器的一次循环
    pub fn work(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        let demanded: Vec<String> = self.backlog.iter().map(|r| r.task.clone()).collect();
        report.activated = self.balancer.balance(&demanded);

        for run in self.orphaned.drain(..) {
            report.finished.push(FinishedRun {
                run_id: run.run_id,
                application_id: run.application_id,
                task: run.task,
                origin: run.origin,
                outcome: RunOutcome::Orphaned,
            });
        }

        let mut waiting = VecDeque::with_capacity(self.backlog.len());
        while let Some(request) = self.backlog.pop_front() {
            match self.balancer.select_worker(&request.task) {
                Some(connection) => {
                    let Some(peer) = self.balancer.worker(connection).map(|w| w.peer.clone())
                    else {
                        waiting.push_back(request);
                        continue;
                    };
                    let run_id = self.allocate_run_id();
                    let payload = ThreadRunPayload {
                        run_id,
                        application_id: request.application_id.clone(),
                        unique_id: request.task.clone(),
                        arguments: request.arguments.clone(),
                    };
                    match self.t_run(run_id, connection, request) {
                        Ok(()) => report.assignments.push(Assignment {
                            run_id,
                            peer,
                            payload,
                        }),
                        Err(e) => warn!(run_id, "运行记录失败: {}", e),
                    }
                }
                None if now.saturating_duration_since(request.received_at)
                    >= self.dispatch_timeout =>
                {
                    warn!(task = %request.task, "没有可用的Worker, 运行请求过期");
                    report.finished.push(FinishedRun {
                        run_id: 0,
                        outcome: RunOutcome::Rejected(format!(
                            "没有可以执行任务 {} 的Worker",
                            request.task
                        )),
                        application_id: request.application_id,
                        task: request.task,
                        origin: request.origin,
                    });
                }
                None => waiting.push_back(request),
            }
        }
        self.backlog = waiting;
        report
    }

    fn allocate_run_id(&mut self) -> u64 {
        loop {
            self.next_run_id += 1;
            if !self.runs.contains_key(&self.next_run_id) {
                return self.next_run_id;
            }
        }
    }

    /// 结束所有在途和积压的运行, 用于控制器停止
    pub fn drain(&mut self) -> Vec<FinishedRun> {
        let mut finished: Vec<FinishedRun> = self
            .runs
            .drain()
            .map(|(_, run)| run)
            .chain(self.orphaned.drain(..))
            .map(|run| FinishedRun {
                run_id: run.run_id,
                application_id: run.application_id,
                task: run.task,
                origin: run.origin,
                outcome: RunOutcome::Orphaned,
            })
            .collect();
        finished.extend(self.backlog.drain(..).map(|request| FinishedRun {
            run_id: 0,
            application_id: request.application_id,
            task: request.task,
            origin: request.origin,
            outcome: RunOutcome::Rejected("控制器正在停止".to_string()),
        }));
        finished
    }

    pub fn run(&self, run_id: u64) -> Option<&RunCorrelation> {
        self.runs.get(&run_id)
    }

    pub fn in_flight(&self) -> usize {
        self.runs.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}
