// 上传会话表
//
// 按客户端记录进行中的上传：临时文件、已收分片数、总分片数、最后活动时间。
// 会话数有上限，已满时新客户端被拒绝，已有客户端不受影响。

use super::request::ChunkRequest;
use super::sink::ChunkSink;
use crate::error::{ChunkError, RegistryError};
use crate::transport::ClientId;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// 一次进行中的上传
#[derive(Debug)]
pub struct UploadSession {
    pub client_id: ClientId,
    pub sink: ChunkSink,
    /// 已写入的分片数
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub last_activity: Instant,
}

impl UploadSession {
    /// 下一个应当到达的分片序号
    pub fn expected_index(&self) -> u32 {
        self.received_chunks
    }

    /// 校验分片是否紧接在已收分片之后
    pub fn check_next(&self, request: &ChunkRequest) -> Result<(), ChunkError> {
        if request.total_chunks != self.total_chunks {
            return Err(ChunkError::TotalMismatch {
                session: self.total_chunks,
                request: request.total_chunks,
            });
        }
        if request.chunk_index != self.expected_index() {
            return Err(ChunkError::OutOfOrder {
                expected: self.expected_index(),
                actual: request.chunk_index,
            });
        }
        Ok(())
    }

    /// 客户端从头重新上传
    pub fn restart(&mut self, total_chunks: u32, now: Instant) {
        self.received_chunks = 0;
        self.total_chunks = total_chunks;
        self.last_activity = now;
    }

    pub fn record_chunk(&mut self, now: Instant) {
        self.received_chunks += 1;
        self.last_activity = now;
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// 会话表
#[derive(Debug)]
pub struct UploadRegistry {
    sessions: HashMap<ClientId, UploadSession>,
    max_sessions: usize,
    sink_dir: PathBuf,
    /// 每新建一个会话加一，用于区分临时文件
    next_generation: u64,
}

impl UploadRegistry {
    pub fn new(max_sessions: usize, sink_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions: HashMap::with_capacity(max_sessions),
            max_sessions,
            sink_dir: sink_dir.into(),
            next_generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, client_id: ClientId) -> Option<&UploadSession> {
        self.sessions.get(&client_id)
    }

    /// 查找或新建会话
    ///
    /// 新建时 `received_chunks = 0`，临时文件尚未创建（由序号 0 的分片创建）。
    pub fn get_or_create(
        &mut self,
        client_id: ClientId,
        total_chunks: u32,
        now: Instant,
    ) -> Result<&mut UploadSession, RegistryError> {
        let active = self.sessions.len();
        match self.sessions.entry(client_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                if active >= self.max_sessions {
                    return Err(RegistryError::CapacityExceeded(self.max_sessions));
                }
                self.next_generation += 1;
                let session = UploadSession {
                    client_id,
                    sink: ChunkSink::new(&self.sink_dir, client_id, self.next_generation),
                    received_chunks: 0,
                    total_chunks,
                    last_activity: now,
                };
                Ok(entry.insert(session))
            }
        }
    }

    /// 移除会话并交出所有权，槽位立即可被其他客户端使用
    pub fn close(&mut self, client_id: ClientId) -> Option<UploadSession> {
        self.sessions.remove(&client_id)
    }

    /// 移除空闲超过 `idle` 的会话
    ///
    /// `is_pending` 为 true 的客户端还有分片在排队，不视为空闲。
    pub fn expire_idle<F>(&mut self, now: Instant, idle: Duration, is_pending: F) -> Vec<UploadSession>
    where
        F: Fn(ClientId) -> bool,
    {
        let expired: Vec<ClientId> = self
            .sessions
            .values()
            .filter(|s| s.idle_for(now) >= idle && !is_pending(s.client_id))
            .map(|s| s.client_id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id))
            .collect()
    }
}
