use std::sync::{Arc, Weak};

use saw_core::{SawError, SawResult};

use crate::thread::Thread;

struct Link {
    owner: Weak<Thread>,
    linked: Weak<Thread>,
}

impl Link {
    fn is_owned_by(&self, owner: &Arc<Thread>) -> bool {
        std::ptr::eq(self.owner.as_ptr(), Arc::as_ptr(owner))
    }

    fn is_alive(&self) -> bool {
        self.owner.strong_count() > 0 && self.linked.strong_count() > 0
    }
}

/// 记录线程之间的单向关联, 例如声明的任务与它的一次远程运行
///
/// 关联按线程对象本身区分, 不同线程池中同名的线程互不影响。两端都只保存弱引用,
/// 被线程池遗忘的线程不会因为关联而继续存活。
#[derive(Default)]
pub struct ThreadLinker {
    links: Vec<Link>,
}

impl ThreadLinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一个线程再次关联时以最后一次为准
    pub fn link_threads(&mut self, owner: &Arc<Thread>, linked: &Arc<Thread>) {
        self.links.retain(|link| link.is_alive() && !link.is_owned_by(owner));
        self.links.push(Link {
            owner: Arc::downgrade(owner),
            linked: Arc::downgrade(linked),
        });
    }

    pub fn get_linked_thread(&self, owner: &Arc<Thread>) -> SawResult<Arc<Thread>> {
        self.links
            .iter()
            .find(|link| link.is_owned_by(owner))
            .and_then(|link| link.linked.upgrade())
            .ok_or_else(|| SawError::NoLinkedThread {
                unique_id: owner.unique_id().to_string(),
            })
    }

    pub fn unlink_threads(&mut self, owner: &Arc<Thread>) -> Option<Arc<Thread>> {
        let position = self.links.iter().position(|link| link.is_owned_by(owner))?;
        let removed = self.links.swap_remove(position);
        self.links.retain(Link::is_alive);
        removed.linked.upgrade()
    }

    /// 两端都还存活的关联数
    pub fn len(&self) -> usize {
        self.links.iter().filter(|link| link.is_alive()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::FnWork;
    use serde_json::Value;

    fn thread(id: u64, unique_id: &str) -> Arc<Thread> {
        Arc::new(Thread::new(
            id,
            unique_id,
            Arc::new(FnWork::new("noop", |_| Ok(Value::Null))),
            Vec::new(),
        ))
    }

    #[test]
    fn test_unlinked_thread_has_no_link() {
        let linker = ThreadLinker::new();
        assert!(matches!(
            linker.get_linked_thread(&thread(1, "a")),
            Err(SawError::NoLinkedThread { .. })
        ));
    }

    #[test]
    fn test_last_link_wins_and_unlink_removes() {
        let mut linker = ThreadLinker::new();
        let owner = thread(1, "a");
        let first = thread(2, "b");
        let second = thread(3, "c");
        linker.link_threads(&owner, &first);
        linker.link_threads(&owner, &second);
        assert_eq!(linker.get_linked_thread(&owner).unwrap().unique_id(), "c");
        assert_eq!(linker.len(), 1);

        assert!(linker.unlink_threads(&owner).is_some());
        assert!(linker.get_linked_thread(&owner).is_err());
        assert!(linker.is_empty());
    }

    #[test]
    fn test_link_does_not_keep_linked_thread_alive() {
        let mut linker = ThreadLinker::new();
        let owner = thread(1, "a");
        let linked = thread(2, "b");
        linker.link_threads(&owner, &linked);
        let weak = Arc::downgrade(&linked);

        drop(linked);
        assert!(weak.upgrade().is_none());
        assert!(matches!(
            linker.get_linked_thread(&owner),
            Err(SawError::NoLinkedThread { .. })
        ));
        assert!(linker.is_empty());
    }

    #[test]
    fn test_owners_with_same_name_in_different_pools_do_not_collide() {
        let mut linker = ThreadLinker::new();
        // 两个线程池各自从1开始编号
        let first_owner = thread(1, "job");
        let second_owner = thread(1, "job");
        let first_run = thread(2, "job#1");
        let second_run = thread(2, "job#2");
        linker.link_threads(&first_owner, &first_run);
        linker.link_threads(&second_owner, &second_run);

        let found = linker.get_linked_thread(&first_owner).unwrap();
        assert!(Arc::ptr_eq(&found, &first_run));
        let found = linker.get_linked_thread(&second_owner).unwrap();
        assert!(Arc::ptr_eq(&found, &second_run));
        assert_eq!(linker.len(), 2);
    }
}
