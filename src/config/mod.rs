// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/hashd.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务端调度配置
    #[serde(default)]
    pub server: ServerConfig,
    /// IPC 资源键
    #[serde(default)]
    pub ipc: IpcConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024 // 20MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务端调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 启动时的 worker 上限（运行时可由控制端修改）
    #[serde(default = "default_initial_workers")]
    pub initial_workers: usize,
    /// 控制端允许设置的最大 worker 上限
    #[serde(default = "default_max_worker_limit")]
    pub max_worker_limit: usize,
    /// 同时进行中的上传会话上限
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// 待处理请求队列容量
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
    /// 单个分片最大字节数（同时也是共享内存段大小）
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// 临时文件目录
    #[serde(default = "default_sink_dir")]
    pub sink_dir: PathBuf,
    /// 会话空闲超时（秒），0 表示不超时
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    /// 主循环最长阻塞时间（毫秒），到期后执行一次会话清理
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

// ServerConfig 默认值函数
fn default_initial_workers() -> usize {
    5
}

fn default_max_worker_limit() -> usize {
    1024
}

fn default_max_sessions() -> usize {
    64
}

fn default_backlog_capacity() -> usize {
    16
}

fn default_max_chunk_size() -> usize {
    64 * 1024
}

fn default_sink_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_session_idle_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_ms() -> u64 {
    500
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            initial_workers: default_initial_workers(),
            max_worker_limit: default_max_worker_limit(),
            max_sessions: default_max_sessions(),
            backlog_capacity: default_backlog_capacity(),
            max_chunk_size: default_max_chunk_size(),
            sink_dir: default_sink_dir(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl ServerConfig {
    /// 会话空闲超时，未启用时返回 None
    pub fn session_idle_timeout(&self) -> Option<Duration> {
        match self.session_idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// 主循环单次阻塞接收的最长时间
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            anyhow::bail!("max_sessions 必须大于 0");
        }
        if self.max_chunk_size == 0 {
            anyhow::bail!("max_chunk_size 必须大于 0");
        }
        if self.initial_workers > self.max_worker_limit {
            anyhow::bail!(
                "initial_workers ({}) 超过 max_worker_limit ({})",
                self.initial_workers,
                self.max_worker_limit
            );
        }
        Ok(())
    }
}

/// System V IPC 资源键
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// 消息队列键
    #[serde(default = "default_msg_key")]
    pub msg_key: i32,
    /// 主共享内存段键（客户端分片缓冲区键 = shm_key + client_id）
    #[serde(default = "default_shm_key")]
    pub shm_key: i32,
    /// 信号量集键
    #[serde(default = "default_sem_key")]
    pub sem_key: i32,
}

fn default_msg_key() -> i32 {
    0x5678
}

fn default_shm_key() -> i32 {
    0x1234
}

fn default_sem_key() -> i32 {
    0x9ABC
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            msg_key: default_msg_key(),
            shm_key: default_shm_key(),
            sem_key: default_sem_key(),
        }
    }
}

impl IpcConfig {
    /// 某个客户端专用分片缓冲区的键
    pub fn client_buffer_key(&self, client_id: i32) -> i32 {
        self.shm_key.wrapping_add(client_id)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .server
            .validate()
            .context("配置文件中的服务端参数验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载配置，失败时使用默认值
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("已加载配置文件: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("加载配置文件失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}
