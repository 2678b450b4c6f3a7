use anyhow::Result;
use saw::app::AppMode;
use saw::common::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    run_cli(
        "saw-worker",
        "控制器/Worker 分布式任务执行系统 - Worker",
        AppMode::Worker,
        "Worker",
    )
    .await
}
