use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use saw_controller::{ControllerCore, Feedback, RunOutcome};
use saw_core::{CommandCode, CommandState, ControllerConfig, Frame, MemoryPeer, Signal, WireMessage};

struct Worker {
    peer: Arc<MemoryPeer>,
    frames: mpsc::UnboundedReceiver<Frame>,
    next_id: u64,
}

impl Worker {
    fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn next_command(&mut self) -> WireMessage {
        match self.frames.try_recv() {
            Ok(Frame::Command(message)) => message,
            other => panic!("expected command, got {other:?}"),
        }
    }

    fn request(&mut self, command: &str, data: Value) -> Value {
        self.next_id += 1;
        json!({"command": command, "state": 1, "id": self.next_id, "code": 0, "data": data})
    }
}

fn controller(dispatch_timeout_ms: u64) -> (ControllerCore, mpsc::UnboundedReceiver<Feedback>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = ControllerConfig {
        worker_max_count: 4,
        dispatch_timeout_ms,
        ..ControllerConfig::default()
    };
    (ControllerCore::new(&config, tx), rx)
}

/// 完成握手并注册Worker, 登记给定的任务
fn join(core: &mut ControllerCore, connection: u64, tasks: &[&str]) -> Worker {
    let (peer, frames) = MemoryPeer::new(connection, format!("worker-{connection}"));
    let mut worker = Worker {
        peer: peer.clone(),
        frames,
        next_id: 0,
    };
    core.on_connect(peer);
    core.on_message(connection, json!("HELLO"));
    let wadd = worker.request("wadd", json!({}));
    core.on_message(connection, wadd);
    for task in tasks {
        let tadd = worker.request("tadd", json!({ "name": task }));
        core.on_message(connection, tadd);
    }

    let frames = worker.drain();
    assert_eq!(frames[0], Frame::Signal(Signal::Hello));
    assert_eq!(frames[1], Frame::Signal(Signal::Accept));
    for frame in &frames[2..] {
        match frame {
            Frame::Command(reply) => assert_eq!(reply.code, CommandCode::Success),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    worker
}

fn tres(worker: &mut Worker, trun: &WireMessage, success: bool, result: Value) -> Value {
    let data = json!({
        "run_id": trun.data["run_id"],
        "application_id": trun.data["application_id"],
        "unique_id": trun.data["unique_id"],
        "success": success,
        "result": result,
    });
    worker.request("tres", data)
}

#[tokio::test]
async fn test_announced_task_maps_to_worker_connection() {
    let (mut core, _feedback) = controller(30_000);
    join(&mut core, 1, &["sum"]);
    assert_eq!(core.distributor().balancer().workers_knowing("sum"), vec![1]);
    assert!(core.distributor().balancer().workers_knowing("mul").is_empty());

    // 重复登记是幂等的
    let mut second = join(&mut core, 2, &["sum", "sum"]);
    assert!(second.drain().is_empty());
    assert_eq!(
        core.distributor().balancer().workers_knowing("sum"),
        vec![1, 2]
    );
}

#[tokio::test]
async fn test_dispatched_run_resolves_and_leaves_in_flight_table() {
    let (mut core, _feedback) = controller(30_000);
    let mut worker = join(&mut core, 1, &["job-7"]);

    let outcome = core.submit_run("app1", "job-7", vec![json!(3)]);
    core.work(Instant::now());
    let trun = worker.next_command();
    assert_eq!(trun.command, "trun");
    assert_eq!(trun.data["application_id"], json!("app1"));
    assert_eq!(trun.data["unique_id"], json!("job-7"));
    let run_id = trun.data["run_id"].as_u64().unwrap();
    assert!(core.distributor().run(run_id).is_some());

    let result = tres(&mut worker, &trun, true, json!({"done": true}));
    core.on_message(1, result);
    let ack = worker.next_command();
    assert_eq!(ack.command, "tres");
    assert_eq!(ack.state, CommandState::Resulted);
    assert_eq!(ack.code, CommandCode::Success);

    assert_eq!(
        outcome.await.unwrap(),
        RunOutcome::Completed(json!({"done": true}))
    );
    assert!(core.distributor().run(run_id).is_none());
    assert_eq!(core.distributor().in_flight(), 0);
}

#[tokio::test]
async fn test_peer_requested_run_is_forwarded_with_requester_run_id() {
    let (mut core, _feedback) = controller(30_000);
    let mut executor = join(&mut core, 1, &["job-7"]);
    let mut requester = join(&mut core, 2, &[]);

    let trun = requester.request(
        "trun",
        json!({"run_id": 7, "application_id": "app1", "unique_id": "job-7", "arguments": []}),
    );
    core.on_message(2, trun);
    assert_eq!(requester.next_command().code, CommandCode::Success);

    core.work(Instant::now());
    let dispatched = executor.next_command();
    assert_eq!(dispatched.data["unique_id"], json!("job-7"));

    let result = tres(&mut executor, &dispatched, false, json!("exit 1"));
    core.on_message(1, result);
    assert_eq!(executor.next_command().code, CommandCode::Success);

    let forwarded = requester.next_command();
    assert_eq!(forwarded.command, "tres");
    assert_eq!(forwarded.state, CommandState::Running);
    assert_eq!(forwarded.data["run_id"], json!(7));
    assert_eq!(forwarded.data["success"], json!(false));
    assert_eq!(forwarded.data["result"], json!("exit 1"));
}

#[tokio::test]
async fn test_worker_deletion_scrubs_registry_and_orphans_runs() {
    let (mut core, _feedback) = controller(30_000);
    let mut first = join(&mut core, 1, &["sum"]);
    join(&mut core, 2, &["sum"]);

    let outcome = core.submit_run("app1", "sum", Vec::new());
    core.work(Instant::now());
    let trun = first.next_command();
    let run_id = trun.data["run_id"].as_u64().unwrap();

    let wdel = first.request("wdel", json!({}));
    core.on_message(1, wdel);
    assert_eq!(first.next_command().code, CommandCode::Success);
    assert_eq!(core.distributor().balancer().workers_knowing("sum"), vec![2]);
    assert!(core.distributor().run(run_id).is_none());

    core.work(Instant::now());
    assert_eq!(outcome.await.unwrap(), RunOutcome::Orphaned);

    // 已删除Worker迟到的结果不会被接受
    let late = tres(&mut first, &trun, true, json!(1));
    core.on_message(1, late);
    assert_eq!(first.next_command().code, CommandCode::Error);
}

#[tokio::test]
async fn test_disconnect_is_processed_like_wdel() {
    let (mut core, _feedback) = controller(30_000);
    let _worker = join(&mut core, 1, &["sum"]);
    core.on_inbound(saw_core::Inbound {
        connection: 1,
        event: saw_core::InboundEvent::Closed,
    });
    assert!(core.distributor().balancer().workers_knowing("sum").is_empty());
    assert_eq!(core.connection_count(), 0);
}

#[tokio::test]
async fn test_unknown_task_is_rejected_after_dispatch_timeout() {
    let (mut core, _feedback) = controller(10);
    join(&mut core, 1, &["sum"]);

    let outcome = core.submit_run("app1", "nope", Vec::new());
    core.work(Instant::now());
    assert_eq!(core.distributor().backlog_len(), 1);

    core.work(Instant::now() + Duration::from_millis(50));
    assert!(matches!(outcome.await.unwrap(), RunOutcome::Rejected(_)));
    assert_eq!(core.distributor().backlog_len(), 0);
}

#[tokio::test]
async fn test_runs_spread_over_active_workers() {
    let (mut core, _feedback) = controller(30_000);
    let mut first = join(&mut core, 1, &["sum"]);
    let mut second = join(&mut core, 2, &["sum"]);

    let _a = core.submit_run("app1", "sum", Vec::new());
    let _b = core.submit_run("app1", "sum", Vec::new());
    core.work(Instant::now());

    assert_eq!(first.next_command().command, "trun");
    assert_eq!(second.next_command().command, "trun");
    assert_eq!(core.distributor().in_flight(), 2);
    assert!(!first.peer.is_closed());
}

#[tokio::test]
async fn test_reply_echoed_by_another_worker_does_not_resolve_dispatch() {
    let (mut core, mut feedback) = controller(30_000);
    let mut executor = join(&mut core, 1, &["sum"]);
    let mut other = join(&mut core, 2, &[]);

    let outcome = core.submit_run("app1", "sum", Vec::new());
    core.work(Instant::now());
    let trun = executor.next_command();
    let run_id = trun.data["run_id"].as_u64().unwrap();

    // 另一个连接复用同一个关联标识送回失败结果
    let forged = json!({
        "command": "trun", "state": 2, "id": trun.id, "code": 2,
        "data": {"error": "forged"}
    });
    core.on_message(2, forged);
    assert!(other.drain().is_empty());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(feedback.try_recv().is_err());
    assert!(core.distributor().run(run_id).is_some());

    let result = tres(&mut executor, &trun, true, json!(5));
    core.on_message(1, result);
    assert_eq!(executor.next_command().code, CommandCode::Success);
    assert_eq!(outcome.await.unwrap(), RunOutcome::Completed(json!(5)));
}
