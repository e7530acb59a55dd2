//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化。文件按大小滚动，启动时清理超过保留天数的旧日志。

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "hashd.";
/// 日志文件名后缀
const LOG_FILE_SUFFIX: &str = ".log";
/// 时间戳格式
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 滚动日志文件（内部状态）
struct RollingFile {
    /// 服务启动时间戳（格式：YYYY-MM-DD-HHMMSS）
    start_timestamp: String,
    log_dir: PathBuf,
    current_file: Option<File>,
    /// 当前文件序号（0 表示基础文件）
    current_index: u32,
    max_file_size: u64,
    current_size: u64,
}

impl RollingFile {
    fn open(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut rolling = Self {
            start_timestamp: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir,
            current_file: None,
            current_index: 0,
            max_file_size,
            current_size: 0,
        };
        rolling.open_current()?;
        Ok(rolling)
    }

    /// hashd.YYYY-MM-DD-HHMMSS.log / hashd.YYYY-MM-DD-HHMMSS_N.log
    fn path_for(&self, index: u32) -> PathBuf {
        let filename = if index == 0 {
            format!("{}{}{}", LOG_FILE_PREFIX, self.start_timestamp, LOG_FILE_SUFFIX)
        } else {
            format!(
                "{}{}_{}{}",
                LOG_FILE_PREFIX, self.start_timestamp, index, LOG_FILE_SUFFIX
            )
        };
        self.log_dir.join(filename)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(self.current_index))?;
        self.current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.current_file = Some(file);
        Ok(())
    }

    fn write_data(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，避免单条超大日志导致无限创建新文件
        if self.current_size > 0 && self.current_size + buf.len() as u64 > self.max_file_size {
            if let Some(mut file) = self.current_file.take() {
                file.flush()?;
            }
            self.current_index += 1;
            self.open_current()?;
        }

        match &mut self.current_file {
            Some(file) => {
                let written = file.write(buf)?;
                self.current_size += written as u64;
                Ok(written)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "日志文件未打开")),
        }
    }

    fn flush_file(&mut self) -> io::Result<()> {
        match &mut self.current_file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 日志文件写入器（线程安全包装）
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl LogFileWriter {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile::open(log_dir, max_file_size)?)),
        })
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_data(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush_file()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的级别。文件层初始化失败时回退为仅控制台输出。
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true);

    let file_writer = if config.enabled {
        open_file_writer(config)
    } else {
        None
    };

    let Some(writer) = file_writer else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let deleted = cleanup_old_logs(&config.log_dir, config.retention_days);
    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 命令行工具使用的日志：只输出到 stderr，不写文件
pub fn init_console_logging(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                .with_writer(io::stderr),
        )
        .init();
}

fn open_file_writer(config: &LogConfig) -> Option<LogFileWriter> {
    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
        return None;
    }

    match LogFileWriter::new(config.log_dir.clone(), config.max_file_size) {
        Ok(writer) => Some(writer),
        Err(e) => {
            eprintln!("创建日志文件失败: {}, 回退到仅控制台输出", e);
            None
        }
    }
}

/// 清理过期日志文件，返回删除的文件数
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted_count = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };

        let Some(date) = log_file_date(filename) else {
            continue;
        };

        if today.signed_duration_since(date) > retention {
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted_count += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    deleted_count
}

/// 从日志文件名中解析日期，非本服务的日志文件返回 None
fn log_file_date(filename: &str) -> Option<chrono::NaiveDate> {
    let name = filename
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = name.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_log_file_date() {
        assert_eq!(
            log_file_date("hashd.2026-01-02-101500.log"),
            chrono::NaiveDate::from_ymd_opt(2026, 1, 2)
        );
        assert_eq!(
            log_file_date("hashd.2026-01-02-101500_3.log"),
            chrono::NaiveDate::from_ymd_opt(2026, 1, 2)
        );
        assert_eq!(log_file_date("other.2026-01-02.log"), None);
        assert_eq!(log_file_date("hashd.garbage.log"), None);
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = TempDir::new().unwrap();
        let mut writer = LogFileWriter::new(dir.path().to_path_buf(), 16).unwrap();

        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"0123456789").unwrap();
        writer.flush().unwrap();

        let count = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_cleanup_removes_only_expired() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("hashd.2000-01-01-000000.log"), b"old").unwrap();
        let fresh = format!("hashd.{}.log", Local::now().format("%Y-%m-%d-%H%M%S"));
        fs::write(dir.path().join(&fresh), b"new").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"keep").unwrap();

        assert_eq!(cleanup_old_logs(dir.path(), 7), 1);
        assert!(dir.path().join(&fresh).exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }
}
