pub mod balancer;
pub mod controller;
pub mod distributor;
pub mod server;

pub use balancer::{WorkerBalancer, WorkerRecord, WorkerState};
pub use controller::{ControllerCore, ControllerState, Feedback};
pub use distributor::{
    Assignment, FinishedRun, RunCorrelation, RunOrigin, RunOutcome, RunRequest,
    ThreadDistributor, TickReport,
};
pub use server::ControllerServer;
