use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use saw_core::{
    to_data, CommandKind, Commander, Peer, ResultHandle, SawError, SawResult, ThreadKnowPayload,
};

use crate::multithreading::{MultiThreading, ThreadRunner};
use crate::pool::ThreadPool;
use crate::thread::{Executable, Thread, ThreadStatus};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Worker已声明的任务, 按线程唯一标识索引
#[derive(Clone, Default)]
pub struct TaskCatalog {
    tasks: Arc<RwLock<HashMap<String, Arc<Thread>>>>,
}

impl TaskCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, thread: Arc<Thread>) {
        self.tasks
            .write()
            .insert(thread.unique_id().to_string(), thread);
    }

    pub fn get(&self, unique_id: &str) -> Option<Arc<Thread>> {
        self.tasks.read().get(unique_id).cloned()
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.tasks.read().contains_key(unique_id)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// 向控制器登记任务名
#[derive(Clone)]
pub struct TaskAnnouncer {
    commander: Commander,
    peer: Arc<dyn Peer>,
    retry_limit: u32,
}

impl TaskAnnouncer {
    pub fn new(commander: Commander, peer: Arc<dyn Peer>, retry_limit: u32) -> Self {
        Self {
            commander,
            peer,
            retry_limit,
        }
    }

    fn send(&self, name: &str) -> SawResult<ResultHandle> {
        let data = to_data(&ThreadKnowPayload {
            name: name.to_string(),
        })?;
        self.commander
            .send(CommandKind::ThreadKnow, self.peer.clone(), data)
    }

    /// 立即发送一次 `tadd`, 失败或被拒绝时在后台重试
    pub fn announce(&self, name: &str) {
        let first = self.send(name);
        let announcer = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            announcer.confirm(name, first).await;
        });
    }

    async fn confirm(&self, name: String, first: SawResult<ResultHandle>) -> bool {
        let mut attempt = first;
        for retry in 0..=self.retry_limit {
            match attempt {
                Ok(handle) => match handle.wait().await {
                    Ok(reply) if reply.is_success() => {
                        debug!(task = %name, "任务登记成功");
                        return true;
                    }
                    Ok(reply) => warn!(task = %name, error = ?reply.data().get("error"), "任务登记被拒绝"),
                    Err(SawError::CommandAbandoned { .. }) => {
                        debug!(task = %name, "连接已断开, 放弃任务登记");
                        return false;
                    }
                    Err(e) => warn!(task = %name, "任务登记失败: {}", e),
                },
                Err(e) => warn!(task = %name, "任务登记发送失败: {}", e),
            }
            if retry == self.retry_limit {
                break;
            }
            tokio::time::sleep(RETRY_BACKOFF * (retry + 1)).await;
            info!(task = %name, attempt = retry + 1, "重试任务登记");
            attempt = self.send(&name);
        }
        warn!(task = %name, "任务登记重试次数已用完");
        false
    }
}

/// 声明线程的同时把新的唯一标识告诉控制器, 每个标识只登记一次
pub struct WorkerThreadCreator {
    runner: ThreadRunner,
    announcer: TaskAnnouncer,
    catalog: TaskCatalog,
    announced: HashSet<String>,
}

impl WorkerThreadCreator {
    pub fn new(runner: ThreadRunner, announcer: TaskAnnouncer, catalog: TaskCatalog) -> Self {
        Self {
            runner,
            announcer,
            catalog,
            announced: HashSet::new(),
        }
    }

    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }
}

#[async_trait]
impl MultiThreading for WorkerThreadCreator {
    fn thread_arguments(
        &mut self,
        unique_id: &str,
        work: Arc<dyn Executable>,
        arguments: Vec<Value>,
    ) -> SawResult<Arc<Thread>> {
        let thread = self.runner.thread_arguments(unique_id, work, arguments)?;
        self.catalog.insert(thread.clone());
        if self.announced.insert(unique_id.to_string()) {
            self.announcer.announce(unique_id);
        }
        Ok(thread)
    }

    fn run_threads(&mut self) -> SawResult<()> {
        self.runner.run_threads()
    }

    async fn synchronize_one(&self, thread: &Thread) -> SawResult<ThreadStatus> {
        self.runner.synchronize_one(thread).await
    }

    async fn synchronize_threads(&self, threads: &[Arc<Thread>]) -> SawResult<Vec<ThreadStatus>> {
        self.runner.synchronize_threads(threads).await
    }

    async fn synchronize_all(&self) -> SawResult<Vec<ThreadStatus>> {
        self.runner.synchronize_all().await
    }

    fn pool(&self) -> &ThreadPool {
        self.runner.pool()
    }
}
