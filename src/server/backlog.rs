// 待处理队列
//
// 没有空闲槽位时到达的分片在这里等待。容量固定，满了之后拒绝新请求，
// 已有条目不会被挤出或修改。选择时总是线性扫描取 payload 最大者，
// 相同大小取最早进入的一个，所以插入时不需要排序。

use super::request::ChunkRequest;
use crate::transport::ClientId;

#[derive(Debug)]
pub struct Backlog {
    entries: Vec<ChunkRequest>,
    capacity: usize,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 加入队尾；队列已满时原样退回请求
    pub fn push(&mut self, request: ChunkRequest) -> Result<(), ChunkRequest> {
        if self.is_full() {
            return Err(request);
        }
        self.entries.push(request);
        Ok(())
    }

    /// payload 最大的条目位置（相同大小取最早的）
    pub fn max_index(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            match best {
                Some(b) if entry.payload_size <= self.entries[b].payload_size => {}
                _ => best = Some(i),
            }
        }
        best
    }

    pub fn peek_max(&self) -> Option<&ChunkRequest> {
        self.max_index().map(|i| &self.entries[i])
    }

    /// 取出 payload 最大的条目，其余条目保持原有顺序
    pub fn take_max(&mut self) -> Option<ChunkRequest> {
        self.max_index().map(|i| self.entries.remove(i))
    }

    /// 是否有该客户端的分片在排队
    pub fn contains_client(&self, client_id: ClientId) -> bool {
        self.entries.iter().any(|e| e.client_id == client_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChunkRequest> {
        self.entries.iter()
    }
}
