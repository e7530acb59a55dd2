use anyhow::Context;
use clap::Parser;
use ipc_hashd::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging,
    transport::{SysvTransport, Transport},
    ServerContext,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 主循环在传输关闭后退出的最长等待时间
const LOOP_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// 基于 System V IPC 的文件摘要服务端
#[derive(Debug, Parser)]
#[command(name = "hashd", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 覆盖配置中的初始 worker 上限
    #[arg(short, long)]
    workers: Option<usize>,
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("无法监听 SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 先加载配置（日志配置在其中），失败时使用默认配置，待日志初始化后再报告
    let (mut config, load_error) = match AppConfig::load_from_file(&cli.config).await {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    if let Some(workers) = cli.workers {
        config.server.initial_workers = workers;
    }

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("hashd v{} 启动中...", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => info!("已加载配置文件: {}", cli.config),
        Some(e) => warn!("加载配置文件失败，使用默认配置: {:#}", e),
    }

    // IPC 资源创建失败直接退出
    let transport = Arc::new(
        SysvTransport::create(&config.ipc, config.server.max_chunk_size)
            .context("创建 IPC 资源失败")?,
    );

    let mut context = match ServerContext::new(
        &config.server,
        transport.clone(),
        tokio::runtime::Handle::current(),
    ) {
        Ok(context) => context,
        Err(e) => {
            if let Err(te) = transport.teardown() {
                error!("清理 IPC 资源失败: {}", te);
            }
            return Err(e.context("初始化服务端失败"));
        }
    };

    let mut server_loop = tokio::task::spawn_blocking(move || context.run());
    let mut loop_finished = false;

    tokio::select! {
        result = &mut server_loop => {
            loop_finished = true;
            match result {
                Ok(()) => warn!("主循环意外结束"),
                Err(e) => error!("主循环异常退出: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始清理 IPC 资源...");
        }
        _ = terminate_signal() => {
            info!("收到 SIGTERM，开始清理 IPC 资源...");
        }
    }

    // 移除消息队列、共享内存、信号量；阻塞中的接收随之返回
    if let Err(e) = transport.teardown() {
        error!("清理 IPC 资源失败: {}", e);
    }

    if !loop_finished {
        match tokio::time::timeout(LOOP_EXIT_TIMEOUT, server_loop).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("主循环异常退出: {}", e),
            Err(_) => warn!("等待主循环退出超时"),
        }
    }

    info!("服务端已退出");
    Ok(())
}
