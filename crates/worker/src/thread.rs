use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use saw_core::{SawError, SawResult, TaskSpec};

/// 线程池分配的线程编号
pub type ThreadId = u64;

/// 一个执行单元运行的结果
pub type WorkResult = Result<Value, String>;

#[derive(Debug, Clone, PartialEq)]
pub enum ThreadStatus {
    Created,
    Running,
    Completed(Value),
    Failed(String),
}

impl ThreadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ThreadStatus::Completed(_) | ThreadStatus::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ThreadStatus::Created => "CREATED",
            ThreadStatus::Running => "RUNNING",
            ThreadStatus::Completed(_) => "COMPLETED",
            ThreadStatus::Failed(_) => "FAILED",
        }
    }
}

/// 执行单元的统一接口
///
/// `launch` 只负责启动: 启动失败直接返回错误,
/// 启动成功后返回的future在执行单元结束时完成。
pub trait Executable: Send + Sync {
    fn launch(&self, arguments: Vec<Value>) -> SawResult<BoxFuture<'static, WorkResult>>;

    fn describe(&self) -> String;
}

/// 由操作系统进程执行的工作
///
/// 参数以字符串追加到命令行之后; 标准输出能解析为JSON时作为JSON结果,
/// 否则作为字符串。非零退出码视为失败。
#[derive(Debug, Clone)]
pub struct ProcessWork {
    program: String,
    args: Vec<String>,
}

impl ProcessWork {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_spec(spec: &TaskSpec) -> Self {
        Self::new(spec.program.clone(), spec.args.clone())
    }
}

fn argument_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn parse_output(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout).trim().to_string();
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

impl Executable for ProcessWork {
    fn launch(&self, arguments: Vec<Value>) -> SawResult<BoxFuture<'static, WorkResult>> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .args(arguments.iter().map(argument_string))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| SawError::internal(format!("无法启动进程 {}: {e}", self.program)))?;
        let program = self.program.clone();
        debug!(program = %program, pid = ?child.id(), "进程已启动");

        Ok(async move {
            let output = child
                .wait_with_output()
                .await
                .map_err(|e| format!("等待进程 {program} 失败: {e}"))?;
            if output.status.success() {
                Ok(parse_output(&output.stdout))
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Err(format!("进程 {program} 退出状态 {}: {stderr}", output.status))
            }
        }
        .boxed())
    }

    fn describe(&self) -> String {
        format!("process:{}", self.program)
    }
}

type WorkFn = dyn Fn(Vec<Value>) -> WorkResult + Send + Sync;

/// 在阻塞线程池上执行的闭包
#[derive(Clone)]
pub struct FnWork {
    name: String,
    work: Arc<WorkFn>,
}

impl FnWork {
    pub fn new<F>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(Vec<Value>) -> WorkResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            work: Arc::new(work),
        }
    }
}

impl Executable for FnWork {
    fn launch(&self, arguments: Vec<Value>) -> SawResult<BoxFuture<'static, WorkResult>> {
        let work = self.work.clone();
        let task = tokio::task::spawn_blocking(move || work(arguments));
        Ok(async move {
            task.await
                .unwrap_or_else(|e| Err(format!("执行单元异常退出: {e}")))
        }
        .boxed())
    }

    fn describe(&self) -> String {
        format!("fn:{}", self.name)
    }
}

/// 工作线程内的一个执行单元
pub struct Thread {
    id: ThreadId,
    unique_id: String,
    work: Arc<dyn Executable>,
    arguments: Vec<Value>,
    status: Arc<watch::Sender<ThreadStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Thread {
    pub fn new(
        id: ThreadId,
        unique_id: impl Into<String>,
        work: Arc<dyn Executable>,
        arguments: Vec<Value>,
    ) -> Self {
        let (status, _) = watch::channel(ThreadStatus::Created);
        Self {
            id,
            unique_id: unique_id.into(),
            work,
            arguments,
            status: Arc::new(status),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn work(&self) -> Arc<dyn Executable> {
        self.work.clone()
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    pub fn status(&self) -> ThreadStatus {
        self.status.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.borrow().is_terminal()
    }

    pub fn result(&self) -> Option<Value> {
        match &*self.status.borrow() {
            ThreadStatus::Completed(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle {
            id: self.id,
            unique_id: self.unique_id.clone(),
            status: self.status.subscribe(),
        }
    }

    /// 启动执行单元; 只能从 `Created` 启动一次
    pub fn start(&self) -> SawResult<()> {
        let current = self.status();
        if current != ThreadStatus::Created {
            return Err(SawError::internal(format!(
                "线程 {} 处于 {} 状态, 不能启动",
                self.unique_id,
                current.name()
            )));
        }

        let running = match self.work.launch(self.arguments.clone()) {
            Ok(running) => running,
            Err(e) => {
                warn!(unique_id = %self.unique_id, "线程启动失败: {}", e);
                self.status.send_replace(ThreadStatus::Failed(e.to_string()));
                return Err(e);
            }
        };
        self.status.send_replace(ThreadStatus::Running);

        let status = self.status.clone();
        let unique_id = self.unique_id.clone();
        let task = tokio::spawn(async move {
            let finished = match running.await {
                Ok(value) => ThreadStatus::Completed(value),
                Err(reason) => ThreadStatus::Failed(reason),
            };
            info!(unique_id = %unique_id, status = finished.name(), "线程已结束");
            status.send_replace(finished);
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// 终止驱动任务, 未结束的线程记为失败
    pub fn abort(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = ThreadStatus::Failed("线程被终止".to_string());
                true
            }
        });
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("unique_id", &self.unique_id)
            .field("work", &self.work.describe())
            .field("status", &*self.status.borrow())
            .finish()
    }
}

/// 观察线程状态的句柄, 可以跨任务传递
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    id: ThreadId,
    unique_id: String,
    status: watch::Receiver<ThreadStatus>,
}

impl ThreadHandle {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn status(&self) -> ThreadStatus {
        self.status.borrow().clone()
    }

    /// 等待线程结束
    pub async fn finished(&mut self) -> ThreadStatus {
        let finished = self
            .status
            .wait_for(ThreadStatus::is_terminal)
            .await
            .map(|status| status.clone());
        // 发送端已释放时以最后一次状态为准
        finished.unwrap_or_else(|_| self.status.borrow().clone())
    }

    /// 在期限内等待线程结束, 超时返回 `None`
    pub async fn wait(&mut self, limit: Duration) -> Option<ThreadStatus> {
        tokio::time::timeout(limit, self.finished()).await.ok()
    }
}
