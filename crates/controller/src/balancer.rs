use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use saw_core::{ConnectionId, Peer, SawError, SawResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// 已登记, 尚未被准入
    Ready,
    /// 已被准入, 可以接收运行请求
    Active,
}

/// 控制器一侧的Worker记录
pub struct WorkerRecord {
    pub connection: ConnectionId,
    pub address: String,
    pub state: WorkerState,
    /// 按登记顺序保存的任务名
    pub tasks: Vec<String>,
    pub peer: Arc<dyn Peer>,
    /// 已分发但尚未返回结果的运行数
    pub running: usize,
    pub connected_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn knows(&self, task: &str) -> bool {
        self.tasks.iter().any(|known| known == task)
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Active
    }

    /// 从登记到 `now` 经过的时间
    pub fn connected_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.connected_at)
    }
}

/// Worker注册表和准入控制
///
/// `workers` 与 `tasks` 两个索引总是一起更新: 任务表中只会出现
/// 已登记且明确声明过该任务的Worker。
pub struct WorkerBalancer {
    workers: HashMap<ConnectionId, WorkerRecord>,
    tasks: HashMap<String, Vec<ConnectionId>>,
    worker_max_count: usize,
}

impl WorkerBalancer {
    pub fn new(worker_max_count: usize) -> Self {
        Self {
            workers: HashMap::new(),
            tasks: HashMap::new(),
            worker_max_count,
        }
    }

    pub fn worker_max_count(&self) -> usize {
        self.worker_max_count
    }

    /// 登记新Worker, 同一连接重复登记不会改变已有记录
    pub fn on_worker_announce(&mut self, peer: Arc<dyn Peer>) -> bool {
        let connection = peer.connection_id();
        if self.workers.contains_key(&connection) {
            debug!(connection, "Worker已经登记过");
            return false;
        }
        let record = WorkerRecord {
            connection,
            address: peer.address().to_string(),
            state: WorkerState::Ready,
            tasks: Vec::new(),
            peer,
            running: 0,
            connected_at: Utc::now(),
        };
        info!(connection, address = %record.address, "Worker已登记");
        self.workers.insert(connection, record);
        true
    }

    /// 删除Worker并从所有任务中清除它
    pub fn on_worker_disconnect(&mut self, connection: ConnectionId) -> Option<WorkerRecord> {
        let record = self.workers.remove(&connection)?;
        for task in &record.tasks {
            if let Some(known) = self.tasks.get_mut(task) {
                known.retain(|c| *c != connection);
                if known.is_empty() {
                    self.tasks.remove(task);
                }
            }
        }
        info!(
            connection,
            address = %record.address,
            tasks = record.tasks.len(),
            connected_secs = record.connected_for(Utc::now()).num_seconds(),
            "Worker已删除"
        );
        Some(record)
    }

    /// 记录Worker支持的任务, 重复声明是无操作; 返回是否为新记录
    pub fn on_task_known(&mut self, connection: ConnectionId, task: &str) -> SawResult<bool> {
        let record = self
            .workers
            .get_mut(&connection)
            .ok_or(SawError::WorkerNotFound { connection })?;
        if record.knows(task) {
            return Ok(false);
        }
        record.tasks.push(task.to_string());
        self.tasks
            .entry(task.to_string())
            .or_default()
            .push(connection);
        debug!(connection, task, "Worker声明了新任务");
        Ok(true)
    }

    /// 一次准入步骤: 在上限之内激活知道积压任务的Worker, 返回新激活的连接
    ///
    /// 还没有活跃Worker的任务优先。达到上限且仍有这样的任务时,
    /// 空闲且不知道任何积压任务的活跃Worker会先退回 `Ready`。
    pub fn balance(&mut self, demanded: &[String]) -> Vec<ConnectionId> {
        if demanded.is_empty() {
            return Vec::new();
        }

        let (uncovered, covered): (Vec<&String>, Vec<&String>) = demanded
            .iter()
            .partition(|task| !self.has_active_worker_for(task));
        if !uncovered.is_empty() && self.active_count() >= self.worker_max_count {
            self.release_idle(demanded);
        }

        let mut activated = Vec::new();
        let mut seen = HashSet::new();
        'tasks: for task in uncovered.into_iter().chain(covered) {
            if !seen.insert(task.as_str()) {
                continue;
            }
            for connection in self.workers_knowing(task) {
                if self.active_count() >= self.worker_max_count {
                    debug!(ceiling = self.worker_max_count, "活跃Worker已达上限");
                    break 'tasks;
                }
                if let Some(record) = self.workers.get_mut(&connection) {
                    if record.state == WorkerState::Ready {
                        record.state = WorkerState::Active;
                        info!(connection, task = task.as_str(), "Worker已激活");
                        activated.push(connection);
                    }
                }
            }
        }
        activated
    }

    fn has_active_worker_for(&self, task: &str) -> bool {
        self.tasks.get(task).is_some_and(|known| {
            known
                .iter()
                .any(|c| self.workers.get(c).is_some_and(WorkerRecord::is_active))
        })
    }

    fn release_idle(&mut self, demanded: &[String]) {
        for record in self.workers.values_mut() {
            if record.is_active()
                && record.running == 0
                && !demanded.iter().any(|task| record.knows(task))
            {
                record.state = WorkerState::Ready;
                debug!(connection = record.connection, "空闲Worker退回待命");
            }
        }
    }

    /// 在知道该任务的活跃Worker中选择在途运行最少的一个, 相同时取最先登记的
    pub fn select_worker(&self, task: &str) -> Option<ConnectionId> {
        self.tasks
            .get(task)?
            .iter()
            .filter_map(|connection| self.workers.get(connection))
            .filter(|record| record.is_active())
            .min_by_key(|record| record.running)
            .map(|record| record.connection)
    }

    pub fn begin_run(&mut self, connection: ConnectionId) {
        if let Some(record) = self.workers.get_mut(&connection) {
            record.running += 1;
        }
    }

    pub fn end_run(&mut self, connection: ConnectionId) {
        if let Some(record) = self.workers.get_mut(&connection) {
            record.running = record.running.saturating_sub(1);
        }
    }

    pub fn workers_knowing(&self, task: &str) -> Vec<ConnectionId> {
        self.tasks.get(task).cloned().unwrap_or_default()
    }

    pub fn worker(&self, connection: ConnectionId) -> Option<&WorkerRecord> {
        self.workers.get(&connection)
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.workers.contains_key(&connection)
    }

    pub fn active_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_active()).count()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saw_core::MemoryPeer;

    fn announce(balancer: &mut WorkerBalancer, connection: ConnectionId) {
        let (peer, _frames) = MemoryPeer::new(connection, format!("10.0.0.{connection}:4000"));
        assert!(balancer.on_worker_announce(peer));
    }

    fn demand(tasks: &[&str]) -> Vec<String> {
        tasks.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_announce_registers_ready_worker() {
        let mut balancer = WorkerBalancer::new(2);
        announce(&mut balancer, 1);
        let record = balancer.worker(1).unwrap();
        assert_eq!(record.state, WorkerState::Ready);
        assert_eq!(record.address, "10.0.0.1:4000");
    }

    #[test]
    fn test_connected_for_measures_from_registration() {
        let mut balancer = WorkerBalancer::new(2);
        announce(&mut balancer, 1);
        let record = balancer.worker(1).unwrap();
        let later = record.connected_at + chrono::Duration::seconds(90);
        assert_eq!(record.connected_for(later).num_seconds(), 90);
        assert!(record.connected_for(Utc::now()).num_milliseconds() >= 0);
    }

    #[test]
    fn test_task_known_is_idempotent() {
        let mut balancer = WorkerBalancer::new(2);
        announce(&mut balancer, 1);
        assert!(balancer.on_task_known(1, "sum").unwrap());
        assert!(!balancer.on_task_known(1, "sum").unwrap());
        assert_eq!(balancer.workers_knowing("sum"), vec![1]);
        assert_eq!(balancer.worker(1).unwrap().tasks, vec!["sum"]);
    }

    #[test]
    fn test_task_known_from_unknown_worker_fails() {
        let mut balancer = WorkerBalancer::new(2);
        assert!(matches!(
            balancer.on_task_known(9, "sum"),
            Err(SawError::WorkerNotFound { connection: 9 })
        ));
        assert!(balancer.workers_knowing("sum").is_empty());
    }

    #[test]
    fn test_disconnect_scrubs_every_task() {
        let mut balancer = WorkerBalancer::new(2);
        announce(&mut balancer, 1);
        announce(&mut balancer, 2);
        balancer.on_task_known(1, "sum").unwrap();
        balancer.on_task_known(1, "mul").unwrap();
        balancer.on_task_known(2, "sum").unwrap();

        assert!(balancer.on_worker_disconnect(1).is_some());
        assert_eq!(balancer.workers_knowing("sum"), vec![2]);
        assert!(balancer.workers_knowing("mul").is_empty());
        assert_eq!(balancer.task_count(), 1);
        assert!(balancer.on_worker_disconnect(1).is_none());
    }

    #[test]
    fn test_balance_respects_ceiling() {
        let mut balancer = WorkerBalancer::new(1);
        for connection in 1..=3 {
            announce(&mut balancer, connection);
        }
        balancer.on_task_known(1, "sum").unwrap();
        balancer.on_task_known(2, "mul").unwrap();
        balancer.on_task_known(3, "sum").unwrap();

        let activated = balancer.balance(&demand(&["sum"]));
        assert_eq!(activated, vec![1]);
        assert_eq!(balancer.active_count(), 1);

        // sum已有活跃Worker, 不再激活
        assert!(balancer.balance(&demand(&["sum"])).is_empty());
        assert_eq!(balancer.worker(3).unwrap().state, WorkerState::Ready);
    }

    #[test]
    fn test_balance_without_backlog_activates_nothing() {
        let mut balancer = WorkerBalancer::new(4);
        announce(&mut balancer, 1);
        balancer.on_task_known(1, "sum").unwrap();
        assert!(balancer.balance(&[]).is_empty());
        assert_eq!(balancer.active_count(), 0);
    }

    #[test]
    fn test_busy_worker_at_ceiling_is_not_released() {
        let mut balancer = WorkerBalancer::new(1);
        announce(&mut balancer, 1);
        announce(&mut balancer, 2);
        balancer.on_task_known(1, "sum").unwrap();
        balancer.on_task_known(2, "mul").unwrap();
        balancer.balance(&demand(&["sum"]));
        balancer.begin_run(1);

        assert!(balancer.balance(&demand(&["mul"])).is_empty());
        assert!(balancer.worker(1).unwrap().is_active());

        balancer.end_run(1);
        assert_eq!(balancer.balance(&demand(&["mul"])), vec![2]);
        assert_eq!(balancer.worker(1).unwrap().state, WorkerState::Ready);
    }

    #[test]
    fn test_select_prefers_least_loaded_then_first_known() {
        let mut balancer = WorkerBalancer::new(3);
        for connection in 1..=3 {
            announce(&mut balancer, connection);
            balancer.on_task_known(connection, "sum").unwrap();
        }
        assert_eq!(balancer.select_worker("sum"), None);

        balancer.balance(&demand(&["sum"]));
        assert_eq!(balancer.active_count(), 3);
        assert_eq!(balancer.select_worker("sum"), Some(1));

        balancer.begin_run(1);
        assert_eq!(balancer.select_worker("sum"), Some(2));
        balancer.begin_run(2);
        balancer.begin_run(3);
        assert_eq!(balancer.select_worker("sum"), Some(1));
        assert_eq!(balancer.select_worker("nope"), None);
    }
}
