use anyhow::Result;
use clap::Parser;
use hwgate::{Args, build_gate_run};
use tracing::{Level, error, info};
use tracing_subscriber::{self, EnvFilter, fmt::format::FmtSpan};

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false) // 不显示目标模块
        .with_thread_ids(true) // 显示线程ID
        .with_file(true) // 显示文件名
        .with_line_number(true) // 显示行号
        .with_span_events(FmtSpan::ACTIVE)
        .with_writer(std::io::stderr)
        .init();

    // 解析命令行参数
    let args = Args::parse();

    info!(version = env!("CARGO_PKG_VERSION"), "启动硬件访问中介");
    info!(config = ?args.config, platform = ?args.platform, "加载配置");

    build_gate_run(args).inspect_err(|e| error!("{:#}", e))
}
