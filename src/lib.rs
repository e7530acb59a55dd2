// IPC 文件摘要服务
// 基于 System V IPC 的本地文件哈希服务核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 错误类型
pub mod error;

// 摘要计算
pub mod digest;

// 传输层（消息队列、共享内存、信号量）
pub mod transport;

// 服务端：准入调度、会话表、worker 派发
pub mod server;

// 客户端：分片上传与控制指令
pub mod client;

// 导出常用类型
pub use client::{send_capacity_directive, UploadClient, UploadReceipt};
pub use config::AppConfig;
pub use digest::{sha256_file, sha256_hex, FileDigest};
pub use error::{ChunkError, ClientError, ControlError, RegistryError, SinkError, TransportError};
pub use server::{CycleOutcome, ServerContext, WorkerCapacity};
pub use transport::{Envelope, MemoryTransport, ReplyStatus, SysvTransport, Transport, Wait};
