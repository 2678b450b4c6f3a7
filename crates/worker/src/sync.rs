use std::time::Duration;

use futures::future::join_all;
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use saw_core::{SawError, SawResult};

use crate::thread::{ThreadHandle, ThreadStatus};

/// 带期限的线程同步
///
/// 等待的是线程状态的变化, 不是轮询。在被等待的线程内部同步自己
/// 不会崩溃, 只会等到超时。
#[derive(Debug, Clone, Copy)]
pub struct Synchronizer {
    limit: Duration,
}

impl Synchronizer {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub async fn synchronize_one(&self, mut handle: ThreadHandle) -> SawResult<ThreadStatus> {
        match handle.wait(self.limit).await {
            Some(status) => Ok(status),
            None => {
                warn!(unique_id = handle.unique_id(), "等待线程超时");
                Err(SawError::SynchronizeTimeout {
                    pending: vec![handle.unique_id().to_string()],
                })
            }
        }
    }

    /// 在同一个期限内等待所有线程, 超时时报告仍未结束的线程
    pub async fn synchronize(&self, handles: Vec<ThreadHandle>) -> SawResult<Vec<ThreadStatus>> {
        let deadline = Instant::now() + self.limit;
        let waits = handles.into_iter().map(|mut handle| async move {
            let finished = timeout_at(deadline, handle.finished()).await.ok();
            (handle.unique_id().to_string(), finished)
        });

        let mut statuses = Vec::new();
        let mut pending = Vec::new();
        for (unique_id, finished) in join_all(waits).await {
            match finished {
                Some(status) => statuses.push(status),
                None => pending.push(unique_id),
            }
        }

        if pending.is_empty() {
            Ok(statuses)
        } else {
            warn!(?pending, "同步超时");
            Err(SawError::SynchronizeTimeout { pending })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{FnWork, Thread};
    use serde_json::json;
    use std::sync::Arc;

    fn sleeper(unique_id: &str, millis: u64) -> Thread {
        let work = FnWork::new("sleep", move |_| {
            std::thread::sleep(Duration::from_millis(millis));
            Ok(json!(millis))
        });
        Thread::new(1, unique_id, Arc::new(work), Vec::new())
    }

    #[tokio::test]
    async fn test_synchronize_one_times_out_on_running_thread() {
        let thread = sleeper("slow", 500);
        thread.start().unwrap();

        let err = Synchronizer::new(Duration::from_millis(50))
            .synchronize_one(thread.handle())
            .await
            .unwrap_err();
        match err {
            SawError::SynchronizeTimeout { pending } => assert_eq!(pending, vec!["slow"]),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(thread.status(), ThreadStatus::Running);
    }

    #[tokio::test]
    async fn test_synchronize_reports_only_unfinished_threads() {
        let fast = sleeper("fast", 1);
        let slow = sleeper("slow", 500);
        fast.start().unwrap();
        slow.start().unwrap();

        let err = Synchronizer::new(Duration::from_millis(200))
            .synchronize(vec![fast.handle(), slow.handle()])
            .await
            .unwrap_err();
        match err {
            SawError::SynchronizeTimeout { pending } => assert_eq!(pending, vec!["slow"]),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(fast.is_terminal());
    }

    #[tokio::test]
    async fn test_synchronize_returns_terminal_statuses() {
        let thread = sleeper("fast", 1);
        thread.start().unwrap();
        let statuses = Synchronizer::new(Duration::from_secs(5))
            .synchronize(vec![thread.handle()])
            .await
            .unwrap();
        assert_eq!(statuses, vec![ThreadStatus::Completed(json!(1))]);
    }
}
