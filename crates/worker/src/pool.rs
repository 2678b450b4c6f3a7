use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use saw_core::{SawError, SawResult};

use crate::thread::{Executable, Thread, ThreadId};

/// 线程池
///
/// 同一个线程既能按池内编号找到, 也能按调用方给出的唯一标识找到,
/// 两个索引在同一次 `&mut self` 调用中一起更新。
#[derive(Default)]
pub struct ThreadPool {
    threads: BTreeMap<ThreadId, Arc<Thread>>,
    unique: HashMap<String, ThreadId>,
    next_id: ThreadId,
}

impl ThreadPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> ThreadId {
        self.next_id += 1;
        self.next_id
    }

    /// 分配编号并加入一个新线程
    pub fn create(
        &mut self,
        unique_id: &str,
        work: Arc<dyn Executable>,
        arguments: Vec<Value>,
    ) -> SawResult<Arc<Thread>> {
        if self.exists(unique_id) {
            return Err(SawError::DuplicateThreadId {
                unique_id: unique_id.to_string(),
            });
        }
        let thread = Arc::new(Thread::new(self.next_id(), unique_id, work, arguments));
        self.add(thread.clone())?;
        Ok(thread)
    }

    pub fn add(&mut self, thread: Arc<Thread>) -> SawResult<()> {
        if self.exists(thread.unique_id()) || self.threads.contains_key(&thread.id()) {
            return Err(SawError::DuplicateThreadId {
                unique_id: thread.unique_id().to_string(),
            });
        }
        self.next_id = self.next_id.max(thread.id());
        self.unique
            .insert(thread.unique_id().to_string(), thread.id());
        debug!(id = thread.id(), unique_id = thread.unique_id(), "线程已加入线程池");
        self.threads.insert(thread.id(), thread);
        Ok(())
    }

    pub fn get_thread_by_id(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.get(&id).cloned()
    }

    pub fn get_thread_by_unique_id(&self, unique_id: &str) -> Option<Arc<Thread>> {
        self.unique
            .get(unique_id)
            .and_then(|id| self.threads.get(id))
            .cloned()
    }

    pub fn exists(&self, unique_id: &str) -> bool {
        self.unique.contains_key(unique_id)
    }

    /// 该线程对象是否就是池中登记的那一个
    pub fn contains(&self, thread: &Thread) -> bool {
        self.threads
            .get(&thread.id())
            .is_some_and(|known| std::ptr::eq(Arc::as_ptr(known), thread))
    }

    /// 从池中移除, 不影响线程本身的运行
    pub fn forget(&mut self, unique_id: &str) -> Option<Arc<Thread>> {
        let id = self.unique.remove(unique_id)?;
        self.threads.remove(&id)
    }

    /// 按编号顺序返回所有线程
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// 终止并移除所有线程
    pub fn clear(&mut self) {
        for thread in self.threads.values() {
            thread.abort();
        }
        self.threads.clear();
        self.unique.clear();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.clear();
    }
}

/// 每个应用一个线程池, 用于执行控制器分发来的运行
#[derive(Default)]
pub struct PoolContainer {
    pools: HashMap<String, ThreadPool>,
}

impl PoolContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得应用的线程池, 不存在时创建
    pub fn pool(&mut self, application_id: &str) -> &mut ThreadPool {
        self.pools.entry(application_id.to_string()).or_default()
    }

    pub fn get(&self, application_id: &str) -> Option<&ThreadPool> {
        self.pools.get(application_id)
    }

    pub fn remove(&mut self, application_id: &str) -> Option<ThreadPool> {
        self.pools.remove(application_id)
    }

    pub fn thread_count(&self) -> usize {
        self.pools.values().map(ThreadPool::len).sum()
    }

    pub fn clear(&mut self) {
        for pool in self.pools.values_mut() {
            pool.clear();
        }
        self.pools.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::FnWork;

    fn work() -> Arc<dyn Executable> {
        Arc::new(FnWork::new("noop", |_| Ok(Value::Null)))
    }

    #[test]
    fn test_duplicate_unique_id_is_rejected() {
        let mut pool = ThreadPool::new();
        pool.create("TEST", work(), Vec::new()).unwrap();
        assert!(matches!(
            pool.create("TEST", work(), Vec::new()),
            Err(SawError::DuplicateThreadId { .. })
        ));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_both_indices_resolve_to_same_thread() {
        let mut pool = ThreadPool::new();
        let first = pool.create("a", work(), Vec::new()).unwrap();
        let second = pool.create("b", work(), Vec::new()).unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);

        for thread in [&first, &second] {
            let by_id = pool.get_thread_by_id(thread.id()).unwrap();
            let by_unique = pool.get_thread_by_unique_id(thread.unique_id()).unwrap();
            assert!(Arc::ptr_eq(&by_id, &by_unique));
            assert!(Arc::ptr_eq(&by_id, thread));
        }
    }

    #[test]
    fn test_add_rejects_taken_id() {
        let mut pool = ThreadPool::new();
        pool.create("a", work(), Vec::new()).unwrap();
        let foreign = Arc::new(Thread::new(1, "b", work(), Vec::new()));
        assert!(pool.add(foreign.clone()).is_err());
        assert!(!pool.exists("b"));
        assert!(!pool.contains(&foreign));
    }

    #[test]
    fn test_forget_removes_both_indices() {
        let mut pool = ThreadPool::new();
        let thread = pool.create("a", work(), Vec::new()).unwrap();
        assert!(pool.forget("a").is_some());
        assert!(pool.get_thread_by_id(thread.id()).is_none());
        assert!(!pool.exists("a"));
        assert!(!pool.contains(&thread));

        // 标识释放后可以重新使用, 编号不会复用
        let again = pool.create("a", work(), Vec::new()).unwrap();
        assert_eq!(again.id(), 2);
    }

    #[test]
    fn test_container_keeps_one_pool_per_application() {
        let mut container = PoolContainer::new();
        container.pool("app1").create("job", work(), Vec::new()).unwrap();
        container.pool("app2").create("job", work(), Vec::new()).unwrap();
        assert_eq!(container.thread_count(), 2);
        assert!(container.get("app1").unwrap().exists("job"));
        container.clear();
        assert_eq!(container.thread_count(), 0);
    }
}
