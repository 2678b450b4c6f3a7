use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use saw_core::{SawError, SawResult, TaskSpec};

use crate::multithreading::MultiThreading;
use crate::thread::ProcessWork;

/// 在Worker上运行的应用, 通过 `MultiThreading` 声明和运行线程
#[async_trait]
pub trait Application: Send + Sync {
    fn id(&self) -> &str;

    async fn run(&self, threading: &mut dyn MultiThreading) -> SawResult<()>;
}

/// 按登记顺序保存应用
#[derive(Default)]
pub struct ApplicationContainer {
    applications: Vec<Arc<dyn Application>>,
}

impl ApplicationContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, application: Arc<dyn Application>) -> SawResult<()> {
        if self.contains(application.id()) {
            return Err(SawError::DuplicateApplication {
                id: application.id().to_string(),
            });
        }
        self.applications.push(application);
        Ok(())
    }

    pub fn get(&self, id: &str) -> SawResult<Arc<dyn Application>> {
        self.applications
            .iter()
            .find(|application| application.id() == id)
            .cloned()
            .ok_or_else(|| SawError::UnknownApplication { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.applications.iter().any(|application| application.id() == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.applications
            .iter()
            .map(|application| application.id().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.applications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }

    /// 依次运行所有应用, 一个应用失败不影响其他应用; 返回失败的应用数
    pub async fn run_all(&self, threading: &mut dyn MultiThreading) -> usize {
        let mut failed = 0;
        for application in &self.applications {
            info!(application = application.id(), "启动应用");
            if let Err(e) = application.run(threading).await {
                error!(application = application.id(), "应用运行失败: {}", e);
                failed += 1;
            }
        }
        failed
    }
}

/// 由配置中的任务列表构成的应用: 把每个任务声明为一个进程线程
pub struct ConfiguredApplication {
    id: String,
    tasks: Vec<TaskSpec>,
}

impl ConfiguredApplication {
    pub fn new(id: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            id: id.into(),
            tasks,
        }
    }
}

#[async_trait]
impl Application for ConfiguredApplication {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, threading: &mut dyn MultiThreading) -> SawResult<()> {
        for task in &self.tasks {
            threading.thread(&task.name, Arc::new(ProcessWork::from_spec(task)))?;
        }
        info!(application = %self.id, tasks = self.tasks.len(), "任务已声明");
        Ok(())
    }
}
