pub mod application;
pub mod creator;
pub mod linker;
pub mod multithreading;
pub mod pool;
pub mod service;
pub mod sync;
pub mod thread;
pub mod worker;

pub use application::{Application, ApplicationContainer, ConfiguredApplication};
pub use creator::{TaskAnnouncer, TaskCatalog, WorkerThreadCreator};
pub use linker::ThreadLinker;
pub use multithreading::{MultiThreading, ThreadRunner};
pub use pool::{PoolContainer, ThreadPool};
pub use service::WorkerService;
pub use sync::Synchronizer;
pub use thread::{
    Executable, FnWork, ProcessWork, Thread, ThreadHandle, ThreadId, ThreadStatus, WorkResult,
};
pub use worker::{RunRequester, WorkerCore, WorkerFeedback, WorkerPhase, WorkerState};
