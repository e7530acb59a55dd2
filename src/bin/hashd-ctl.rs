use anyhow::Context;
use clap::Parser;
use ipc_hashd::{
    client::send_capacity_directive,
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging,
    transport::SysvTransport,
    ClientError,
};
use std::time::Duration;
use tracing::warn;

/// 修改 hashd 的 worker 上限
#[derive(Debug, Parser)]
#[command(name = "hashd-ctl", version, about)]
struct Cli {
    /// 新的 worker 上限（必须大于 0）
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    max_workers: u64,

    /// 配置文件路径（读取 IPC 键）
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 未收到服务端确认时以失败退出
    #[arg(long)]
    wait_ack: bool,

    /// 等待确认的秒数
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_console_logging("warn");

    let config = AppConfig::load_or_default(&cli.config).await;
    let sender = std::process::id() as i32;
    let transport = SysvTransport::open(&config.ipc, config.server.max_chunk_size)
        .context("连接服务端失败，hashd 是否已启动？")?;

    // 总是读取确认，避免回复滞留在队列中
    let timeout = Duration::from_secs(cli.timeout_secs);
    let result = tokio::task::spawn_blocking(move || {
        send_capacity_directive(&transport, sender, cli.max_workers, Some(timeout))
    })
    .await
    .context("控制任务异常退出")?;

    match result {
        Ok(applied) => {
            println!("worker 上限已设置为 {}", applied.unwrap_or(cli.max_workers));
            Ok(())
        }
        Err(ClientError::Timeout(_)) if !cli.wait_ack => {
            warn!("未收到服务端确认");
            println!("已发送新的 worker 上限: {}", cli.max_workers);
            Ok(())
        }
        Err(e) => Err(e).context("设置 worker 上限失败"),
    }
}
