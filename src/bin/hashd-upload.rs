use anyhow::Context;
use clap::Parser;
use ipc_hashd::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging,
    transport::SysvTransport,
    UploadClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// 把文件分片上传到 hashd，打印 SHA-256
#[derive(Debug, Parser)]
#[command(name = "hashd-upload", version, about)]
struct Cli {
    /// 要计算摘要的文件
    file: PathBuf,

    /// 配置文件路径（读取 IPC 键与分片大小）
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 等待每条回复的最长秒数，0 表示一直等待
    #[arg(short, long, default_value_t = 60)]
    timeout_secs: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_console_logging("warn");

    let config = AppConfig::load_or_default(&cli.config).await;
    let client_id = std::process::id() as i32;
    let buffer = config.ipc.client_buffer_key(client_id);
    let chunk_size = config.server.max_chunk_size;

    let transport = Arc::new(
        SysvTransport::open(&config.ipc, chunk_size).context("连接服务端失败，hashd 是否已启动？")?,
    );

    let mut client = UploadClient::new(transport, client_id, buffer, chunk_size)?;
    if cli.timeout_secs > 0 {
        client = client.with_reply_timeout(Duration::from_secs(cli.timeout_secs));
    }

    let path = cli.file.clone();
    let receipt = tokio::task::spawn_blocking(move || client.upload_file(&path))
        .await
        .context("上传任务异常退出")?
        .with_context(|| format!("上传失败: {}", cli.file.display()))?;

    println!("{}  {}", receipt.digest, cli.file.display());
    Ok(())
}
