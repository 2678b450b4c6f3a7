use anyhow::Result;
use clap::{Arg, Command};

use saw::app::AppMode;
use saw::common::{common_args, controller_args, start_application, worker_args, StartupConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("saw")
        .version(env!("CARGO_PKG_VERSION"))
        .about("控制器/Worker 分布式任务执行系统")
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(AppMode::NAMES)
                .required(true),
        )
        .args(common_args())
        .args(controller_args())
        .args(worker_args())
        .get_matches();

    let mode = match matches.get_one::<String>("mode") {
        Some(mode) => AppMode::parse(mode)?,
        None => return Err(anyhow::anyhow!("缺少运行模式")),
    };
    let service_name = match mode {
        AppMode::Controller => "Controller",
        AppMode::Worker => "Worker",
    };
    start_application(StartupConfig::from_matches(&matches), mode, service_name).await
}
