//! 错误类型

use crate::transport::{ClientId, ReplyStatus};
use thiserror::Error;

/// 传输层错误
#[derive(Debug, Error)]
pub enum TransportError {
    /// IPC 系统调用失败
    #[error("{op} 失败: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// IPC 资源已被移除（服务端关闭）
    #[error("传输通道已关闭")]
    Closed,

    /// 消息队列已满，非阻塞发送未能写入
    #[error("消息队列已满")]
    QueueFull,

    /// 分片缓冲区不存在
    #[error("分片缓冲区不存在: handle={0}")]
    UnknownBuffer(i32),

    /// 分片长度超过缓冲区大小
    #[error("分片长度 {len} 超过缓冲区大小 {capacity}")]
    ChunkTooLarge { len: usize, capacity: usize },
}

impl TransportError {
    pub(crate) fn os(op: &'static str) -> Self {
        Self::Os {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    /// 是否为不可恢复的关闭错误
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// 会话表错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// 会话表已满且客户端为新客户端
    #[error("会话数已达上限 ({0})")]
    CapacityExceeded(usize),
}

/// 分片请求校验错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("分片序号 {index} 超出总数 {total}")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("结束标记与分片序号不一致: index={index}, total={total}, is_final={is_final}")]
    FinalMismatch { index: u32, total: u32, is_final: bool },

    #[error("分片大小 {size} 超过上限 {max}")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("分片乱序: 期望 #{expected}，收到 #{actual}")]
    OutOfOrder { expected: u32, actual: u32 },

    #[error("总分片数与会话不一致: 会话 {session}，请求 {request}")]
    TotalMismatch { session: u32, request: u32 },
}

/// 控制指令错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    /// 按有符号整数解释为负数
    #[error("worker 上限不能为负数: {0}")]
    Negative(u64),

    #[error("worker 上限 {requested} 超过允许的最大值 {max}")]
    AboveMaximum { requested: u64, max: usize },
}

/// 临时文件写入错误
#[derive(Debug, Error)]
#[error("写入临时文件 {path:?} 失败: {source}")]
pub struct SinkError {
    pub path: std::path::PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// 客户端错误
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("读取文件失败: {0}")]
    Io(#[from] std::io::Error),

    /// 服务端明确拒绝
    #[error("服务端拒绝请求: {0}")]
    Rejected(ReplyStatus),

    /// 等待回复超时
    #[error("等待服务端回复超时 (client_id={0})")]
    Timeout(ClientId),

    /// 收到与当前步骤不匹配的回复
    #[error("收到意外回复: {0}")]
    UnexpectedReply(ReplyStatus),

    #[error("无效的 worker 上限: {0}")]
    InvalidLimit(u64),

    /// 客户端标识必须大于控制消息类型，否则回复无法与请求区分
    #[error("无效的客户端标识: {0}")]
    InvalidClientId(ClientId),
}
