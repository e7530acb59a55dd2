// 传输层
//
// 服务端与客户端之间的三类 IPC 资源：
// - 消息队列：传递定长信封
// - 分片缓冲区：承载每个分片的数据
// - 缓冲区锁：串行化缓冲区的 attach/copy/detach
//
// SysvTransport 为生产实现，MemoryTransport 为进程内实现（测试与嵌入使用）。

pub mod envelope;
pub mod memory;
pub mod sysv;

pub use envelope::{
    is_addressable, BufferHandle, ClientId, Envelope, ReplyStatus, CONTROL_MESSAGE_TYPE,
    DATA_MESSAGE_TYPE, DIGEST_HEX_LEN,
};
pub use memory::MemoryTransport;
pub use sysv::SysvTransport;

use crate::error::TransportError;
use std::time::Duration;

/// 接收等待方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// 无消息时立即返回 None
    NoWait,
    /// 最多等待指定时长
    Timeout(Duration),
    /// 一直等待直到有消息或通道关闭
    Blocking,
}

/// 传输层接口
///
/// 所有方法均为同步调用；服务端主循环运行在独立的阻塞线程上。
pub trait Transport: Send + Sync {
    /// 接收下一条发往服务端的请求（控制指令优先于数据分片）
    fn recv_request(&self, wait: Wait) -> Result<Option<Envelope>, TransportError>;

    /// 接收发往指定客户端的回复
    fn recv_reply(&self, client_id: ClientId, wait: Wait)
        -> Result<Option<Envelope>, TransportError>;

    /// 发送一条消息，队列已满时等待
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// 服务端回复：不等待，队列已满时返回 `QueueFull`
    fn send_reply(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// 丢弃队列中发往该客户端、尚未被取走的回复，返回丢弃数量
    fn discard_replies(&self, client_id: ClientId) -> Result<usize, TransportError>;

    /// 客户端进程是否可能仍然存活（无法判断时返回 true）
    fn client_alive(&self, _client_id: ClientId) -> bool {
        true
    }

    /// 在缓冲区锁保护下从缓冲区复制出 `len` 字节
    fn read_chunk(&self, handle: BufferHandle, len: usize) -> Result<Vec<u8>, TransportError>;

    /// 在缓冲区锁保护下把数据写入缓冲区（不存在则创建）
    fn write_chunk(&self, handle: BufferHandle, data: &[u8]) -> Result<(), TransportError>;

    /// 删除客户端自己的缓冲区
    fn remove_buffer(&self, handle: BufferHandle) -> Result<(), TransportError>;

    /// 按顺序移除通道、缓冲区、锁；之后所有阻塞中的接收返回 Closed
    fn teardown(&self) -> Result<(), TransportError>;
}
