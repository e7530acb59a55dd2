// 分片请求

use crate::error::ChunkError;
use crate::transport::{BufferHandle, ClientId, Envelope};

/// 一个待写入的分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub client_id: ClientId,
    /// 本分片有效字节数
    pub payload_size: u64,
    /// 分片序号（从 0 开始）
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub is_final: bool,
    pub buffer_handle: BufferHandle,
}

impl ChunkRequest {
    /// 从数据分片信封构造并校验
    ///
    /// 要求 `chunk_index < total_chunks`，`is_final` 当且仅当是最后一个分片，
    /// 且分片大小不超过缓冲区大小。
    pub fn from_envelope(envelope: &Envelope, max_chunk_size: usize) -> Result<Self, ChunkError> {
        let index = envelope.chunk_index;
        let total = envelope.total_chunks;

        if index >= total {
            return Err(ChunkError::IndexOutOfRange { index, total });
        }
        if envelope.is_final != (index == total - 1) {
            return Err(ChunkError::FinalMismatch {
                index,
                total,
                is_final: envelope.is_final,
            });
        }
        if envelope.payload_size > max_chunk_size as u64 {
            return Err(ChunkError::PayloadTooLarge {
                size: envelope.payload_size,
                max: max_chunk_size,
            });
        }

        Ok(Self {
            client_id: envelope.client_id,
            payload_size: envelope.payload_size,
            chunk_index: index,
            total_chunks: total,
            is_final: envelope.is_final,
            buffer_handle: envelope.buffer_handle,
        })
    }

    /// 本分片的确认回复
    pub fn ack(&self) -> Envelope {
        Envelope::ack(self.client_id, self.chunk_index)
    }
}
