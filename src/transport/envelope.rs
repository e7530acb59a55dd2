// 消息信封
//
// 请求和回复共用同一个定长结构：
// - type = 1：数据分片（客户端 -> 服务端）
// - type = 99：控制指令（控制端 -> 服务端）
// - type = client_id：分片确认、摘要回复、拒绝回复（服务端 -> 客户端）

use std::fmt;

/// 客户端标识（SysV 实现中为客户端进程 PID）
pub type ClientId = i32;

/// 分片缓冲区标识（SysV 实现中为共享内存段键）
pub type BufferHandle = i32;

/// 数据分片消息类型
pub const DATA_MESSAGE_TYPE: i64 = 1;

/// 控制指令消息类型
pub const CONTROL_MESSAGE_TYPE: i64 = 99;

/// 十六进制摘要长度（SHA-256）
pub const DIGEST_HEX_LEN: usize = 64;

/// 能否作为回复的消息类型
///
/// 回复的 type 就是 client_id，必须大于所有请求类型，否则会被服务端当作请求收回。
pub fn is_addressable(client_id: ClientId) -> bool {
    client_id as i64 > CONTROL_MESSAGE_TYPE
}

/// 回复状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ReplyStatus {
    /// 请求消息，无状态
    #[default]
    None = 0,
    /// 分片已写入
    Ack = 1,
    /// 摘要回复（上传结束）
    Digest = 2,
    /// 控制指令已生效
    ControlAck = 3,
    /// 会话表已满
    SessionLimit = 10,
    /// 待处理队列已满
    BacklogFull = 11,
    /// 请求字段不合法
    BadRequest = 12,
    /// 临时文件写入失败
    SinkFailed = 13,
    /// 摘要计算失败
    DigestFailed = 14,
    /// 会话空闲超时被回收
    Expired = 15,
}

impl ReplyStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        let status = match value {
            0 => Self::None,
            1 => Self::Ack,
            2 => Self::Digest,
            3 => Self::ControlAck,
            10 => Self::SessionLimit,
            11 => Self::BacklogFull,
            12 => Self::BadRequest,
            13 => Self::SinkFailed,
            14 => Self::DigestFailed,
            15 => Self::Expired,
            _ => return None,
        };
        Some(status)
    }

    /// 是否为终止会话的拒绝回复
    pub fn is_rejection(&self) -> bool {
        (*self as u8) >= 10
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::None => "无",
            Self::Ack => "分片确认",
            Self::Digest => "摘要回复",
            Self::ControlAck => "控制确认",
            Self::SessionLimit => "同时上传数已达上限",
            Self::BacklogFull => "待处理队列已满",
            Self::BadRequest => "请求不合法",
            Self::SinkFailed => "临时文件写入失败",
            Self::DigestFailed => "摘要计算失败",
            Self::Expired => "会话超时",
        };
        f.write_str(text)
    }
}

/// 消息信封
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// 消息类型
    pub mtype: i64,
    /// 发送方客户端标识
    pub client_id: ClientId,
    /// 回复状态
    pub status: ReplyStatus,
    /// 数据分片：有效字节数；控制指令：新的 worker 上限；摘要回复：文件总字节数
    pub payload_size: u64,
    /// 十六进制摘要，仅摘要回复中非空
    pub digest: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub is_final: bool,
    /// 保存本分片数据的缓冲区
    pub buffer_handle: BufferHandle,
}

impl Envelope {
    fn empty(mtype: i64, client_id: ClientId) -> Self {
        Self {
            mtype,
            client_id,
            status: ReplyStatus::None,
            payload_size: 0,
            digest: String::new(),
            chunk_index: 0,
            total_chunks: 0,
            is_final: false,
            buffer_handle: 0,
        }
    }

    /// 数据分片请求，结束标记由序号推导
    pub fn chunk(
        client_id: ClientId,
        buffer_handle: BufferHandle,
        payload_size: u64,
        chunk_index: u32,
        total_chunks: u32,
    ) -> Self {
        Self {
            payload_size,
            chunk_index,
            total_chunks,
            is_final: chunk_index.checked_add(1) == Some(total_chunks),
            buffer_handle,
            ..Self::empty(DATA_MESSAGE_TYPE, client_id)
        }
    }

    /// 修改 worker 上限的控制指令
    pub fn control(sender: ClientId, new_limit: u64) -> Self {
        Self {
            payload_size: new_limit,
            ..Self::empty(CONTROL_MESSAGE_TYPE, sender)
        }
    }

    /// 分片确认
    pub fn ack(client_id: ClientId, chunk_index: u32) -> Self {
        Self {
            status: ReplyStatus::Ack,
            chunk_index,
            ..Self::empty(client_id as i64, client_id)
        }
    }

    /// 摘要回复
    pub fn digest_reply(client_id: ClientId, file_size: u64, digest: String) -> Self {
        Self {
            status: ReplyStatus::Digest,
            payload_size: file_size,
            digest,
            ..Self::empty(client_id as i64, client_id)
        }
    }

    /// 控制指令确认，携带生效后的上限
    pub fn control_ack(sender: ClientId, applied_limit: u64) -> Self {
        Self {
            status: ReplyStatus::ControlAck,
            payload_size: applied_limit,
            ..Self::empty(sender as i64, sender)
        }
    }

    /// 拒绝回复
    pub fn rejection(client_id: ClientId, status: ReplyStatus) -> Self {
        Self {
            status,
            ..Self::empty(client_id as i64, client_id)
        }
    }

    pub fn is_control(&self) -> bool {
        self.mtype == CONTROL_MESSAGE_TYPE
    }

    pub fn is_data(&self) -> bool {
        self.mtype == DATA_MESSAGE_TYPE
    }

    /// 是否是服务端需要接收的请求
    pub fn is_request(&self) -> bool {
        self.is_data() || self.is_control()
    }
}
