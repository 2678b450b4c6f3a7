use anyhow::Result;
use saw::app::AppMode;
use saw::common::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    run_cli(
        "saw-controller",
        "控制器/Worker 分布式任务执行系统 - 控制器",
        AppMode::Controller,
        "Controller",
    )
    .await
}
