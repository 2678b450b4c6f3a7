use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use saw_core::{SawError, SawResult};

use crate::pool::ThreadPool;
use crate::sync::Synchronizer;
use crate::thread::{Executable, Thread, ThreadStatus};

/// 多执行单元能力
#[async_trait]
pub trait MultiThreading: Send {
    /// 声明一个新线程, 处于 `Created` 状态
    fn thread(&mut self, unique_id: &str, work: Arc<dyn Executable>) -> SawResult<Arc<Thread>> {
        self.thread_arguments(unique_id, work, Vec::new())
    }

    fn thread_arguments(
        &mut self,
        unique_id: &str,
        work: Arc<dyn Executable>,
        arguments: Vec<Value>,
    ) -> SawResult<Arc<Thread>>;

    /// 启动所有 `Created` 线程
    ///
    /// 启动失败的线程单独记为 `Failed`, 已经启动的线程继续运行,
    /// 返回的 `ThreadStartFailed` 列出未能启动的线程。
    fn run_threads(&mut self) -> SawResult<()>;

    async fn synchronize_one(&self, thread: &Thread) -> SawResult<ThreadStatus>;

    /// 任何一个线程不属于本线程池时直接失败, 不做部分等待
    async fn synchronize_threads(&self, threads: &[Arc<Thread>]) -> SawResult<Vec<ThreadStatus>>;

    /// 等待所有已经启动过的线程, 仍处于 `Created` 的线程不在等待之列
    async fn synchronize_all(&self) -> SawResult<Vec<ThreadStatus>>;

    fn pool(&self) -> &ThreadPool;
}

/// 基于线程池的默认实现
pub struct ThreadRunner {
    pool: ThreadPool,
    synchronizer: Synchronizer,
}

impl ThreadRunner {
    pub fn new(sync_timeout: Duration) -> Self {
        Self {
            pool: ThreadPool::new(),
            synchronizer: Synchronizer::new(sync_timeout),
        }
    }

    pub fn pool_mut(&mut self) -> &mut ThreadPool {
        &mut self.pool
    }

    fn ensure_member(&self, thread: &Thread) -> SawResult<()> {
        if self.pool.contains(thread) {
            Ok(())
        } else {
            Err(SawError::UnknownThread {
                unique_id: thread.unique_id().to_string(),
            })
        }
    }
}

#[async_trait]
impl MultiThreading for ThreadRunner {
    fn thread_arguments(
        &mut self,
        unique_id: &str,
        work: Arc<dyn Executable>,
        arguments: Vec<Value>,
    ) -> SawResult<Arc<Thread>> {
        self.pool.create(unique_id, work, arguments)
    }

    fn run_threads(&mut self) -> SawResult<()> {
        let mut started = 0;
        let mut failed = Vec::new();
        for thread in self.pool.threads() {
            if thread.status() != ThreadStatus::Created {
                continue;
            }
            match thread.start() {
                Ok(()) => started += 1,
                Err(_) => failed.push(thread.unique_id().to_string()),
            }
        }
        info!(started, failed = failed.len(), "线程已启动");

        if failed.is_empty() {
            Ok(())
        } else {
            warn!(?failed, "部分线程未能启动");
            Err(SawError::ThreadStartFailed { failed })
        }
    }

    async fn synchronize_one(&self, thread: &Thread) -> SawResult<ThreadStatus> {
        self.ensure_member(thread)?;
        self.synchronizer.synchronize_one(thread.handle()).await
    }

    async fn synchronize_threads(&self, threads: &[Arc<Thread>]) -> SawResult<Vec<ThreadStatus>> {
        for thread in threads {
            self.ensure_member(thread)?;
        }
        let handles = threads.iter().map(|thread| thread.handle()).collect();
        self.synchronizer.synchronize(handles).await
    }

    async fn synchronize_all(&self) -> SawResult<Vec<ThreadStatus>> {
        let handles = self
            .pool
            .threads()
            .iter()
            .filter(|thread| thread.status() != ThreadStatus::Created)
            .map(|thread| thread.handle())
            .collect();
        self.synchronizer.synchronize(handles).await
    }

    fn pool(&self) -> &ThreadPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{FnWork, ProcessWork};
    use serde_json::json;

    fn double() -> Arc<dyn Executable> {
        Arc::new(FnWork::new("double", |args| {
            let value = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(value * 2))
        }))
    }

    #[tokio::test]
    async fn test_run_and_synchronize_all() {
        let mut runner = ThreadRunner::new(Duration::from_secs(5));
        runner
            .thread_arguments("one", double(), vec![json!(1)])
            .unwrap();
        runner
            .thread_arguments("two", double(), vec![json!(2)])
            .unwrap();
        runner.run_threads().unwrap();

        let statuses = runner.synchronize_all().await.unwrap();
        assert_eq!(
            statuses,
            vec![
                ThreadStatus::Completed(json!(2)),
                ThreadStatus::Completed(json!(4))
            ]
        );
    }

    #[tokio::test]
    async fn test_synchronize_all_skips_threads_never_started() {
        let mut runner = ThreadRunner::new(Duration::from_millis(200));
        runner
            .thread_arguments("started", double(), vec![json!(3)])
            .unwrap();
        runner.run_threads().unwrap();
        let declared = runner.thread("declared", double()).unwrap();

        let statuses = runner.synchronize_all().await.unwrap();
        assert_eq!(statuses, vec![ThreadStatus::Completed(json!(6))]);
        assert_eq!(declared.status(), ThreadStatus::Created);
    }

    #[tokio::test]
    async fn test_partial_start_is_reported_individually() {
        let mut runner = ThreadRunner::new(Duration::from_secs(5));
        let good = runner.thread("good", double()).unwrap();
        let bad = runner
            .thread(
                "bad",
                Arc::new(ProcessWork::new("/nonexistent/saw-program", Vec::new())),
            )
            .unwrap();

        match runner.run_threads() {
            Err(SawError::ThreadStartFailed { failed }) => assert_eq!(failed, vec!["bad"]),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(bad.status(), ThreadStatus::Failed(_)));
        assert_eq!(
            runner.synchronize_one(&good).await.unwrap(),
            ThreadStatus::Completed(json!(0))
        );
    }

    #[tokio::test]
    async fn test_foreign_thread_fails_without_waiting() {
        let mut runner = ThreadRunner::new(Duration::from_secs(30));
        let member = runner
            .thread(
                "member",
                Arc::new(FnWork::new("sleep", |_| {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(Value::Null)
                })),
            )
            .unwrap();
        runner.run_threads().unwrap();
        let foreign = Arc::new(Thread::new(99, "foreign", double(), Vec::new()));

        let started = std::time::Instant::now();
        let err = runner
            .synchronize_threads(&[member.clone(), foreign])
            .await
            .unwrap_err();
        assert!(matches!(err, SawError::UnknownThread { ref unique_id } if unique_id == "foreign"));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(member.status(), ThreadStatus::Running);
    }

    #[tokio::test]
    async fn test_same_unique_id_from_another_pool_is_unknown() {
        let mut first = ThreadRunner::new(Duration::from_secs(1));
        let mut second = ThreadRunner::new(Duration::from_secs(1));
        first.thread("job", double()).unwrap();
        let other = second.thread("job", double()).unwrap();
        assert!(matches!(
            first.synchronize_one(&other).await,
            Err(SawError::UnknownThread { .. })
        ));
    }
}
