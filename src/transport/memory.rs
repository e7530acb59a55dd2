// 进程内传输实现
//
// 与 SysV 实现保持相同的选择性接收语义：
// - 请求接收只取 type 1 / type 99，且控制指令优先
// - 回复接收只取 type == client_id
// 缓冲区为定长内存块，模拟共享内存段。
// 可选的队列长度上限模拟消息队列写满：send 等待空间，send_reply 立即失败。

use super::{BufferHandle, ClientId, Envelope, Transport, Wait};
use crate::error::TransportError;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Envelope>,
    buffers: HashMap<BufferHandle, Vec<u8>>,
    /// 已标记退出的客户端
    departed: HashSet<ClientId>,
    closed: bool,
}

/// 进程内传输
#[derive(Debug)]
pub struct MemoryTransport {
    state: Mutex<State>,
    ready: Condvar,
    /// 每个缓冲区的固定大小
    buffer_size: usize,
    /// 队列中最多容纳的消息数
    queue_limit: Option<usize>,
}

impl MemoryTransport {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Condvar::new(),
            buffer_size,
            queue_limit: None,
        }
    }

    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = Some(limit.max(1));
        self
    }

    /// 标记客户端进程已退出
    pub fn mark_departed(&self, client_id: ClientId) {
        self.state.lock().departed.insert(client_id);
    }

    /// 队列中尚未被取走的消息数
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// 立即取出发往某客户端的全部回复（按发送顺序）
    pub fn drain_replies(&self, client_id: ClientId) -> Vec<Envelope> {
        let mut state = self.state.lock();
        let mut replies = Vec::new();
        state.queue.retain(|msg| {
            if msg.mtype == client_id as i64 && !msg.is_request() {
                replies.push(msg.clone());
                false
            } else {
                true
            }
        });
        replies
    }

    fn take_where<F>(&self, wait: Wait, pick: F) -> Result<Option<Envelope>, TransportError>
    where
        F: Fn(&VecDeque<Envelope>) -> Option<usize>,
    {
        let mut deadline: Option<Instant> = None;
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(TransportError::Closed);
            }
            if let Some(index) = pick(&state.queue) {
                let taken = state.queue.remove(index);
                drop(state);
                self.ready.notify_all();
                return Ok(taken);
            }

            match wait {
                Wait::NoWait => return Ok(None),
                Wait::Blocking => self.ready.wait(&mut state),
                Wait::Timeout(duration) => {
                    let until = *deadline.get_or_insert_with(|| Instant::now() + duration);
                    if self.ready.wait_until(&mut state, until).timed_out() {
                        if state.closed {
                            return Err(TransportError::Closed);
                        }
                        let taken = pick(&state.queue).and_then(|i| state.queue.remove(i));
                        drop(state);
                        self.ready.notify_all();
                        return Ok(taken);
                    }
                }
            }
        }
    }

    fn push(&self, envelope: &Envelope, nowait: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(TransportError::Closed);
            }
            match self.queue_limit {
                Some(limit) if state.queue.len() >= limit => {
                    if nowait {
                        return Err(TransportError::QueueFull);
                    }
                    self.ready.wait(&mut state);
                }
                _ => break,
            }
        }
        state.queue.push_back(envelope.clone());
        drop(state);
        self.ready.notify_all();
        Ok(())
    }
}

fn pick_request(queue: &VecDeque<Envelope>) -> Option<usize> {
    queue
        .iter()
        .position(Envelope::is_control)
        .or_else(|| queue.iter().position(Envelope::is_data))
}

impl Transport for MemoryTransport {
    fn recv_request(&self, wait: Wait) -> Result<Option<Envelope>, TransportError> {
        self.take_where(wait, pick_request)
    }

    fn recv_reply(
        &self,
        client_id: ClientId,
        wait: Wait,
    ) -> Result<Option<Envelope>, TransportError> {
        let mtype = client_id as i64;
        self.take_where(wait, |queue| {
            queue
                .iter()
                .position(|msg| msg.mtype == mtype && !msg.is_request())
        })
    }

    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.push(envelope, false)
    }

    fn send_reply(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.push(envelope, true)
    }

    fn discard_replies(&self, client_id: ClientId) -> Result<usize, TransportError> {
        let discarded = self.drain_replies(client_id).len();
        if discarded > 0 {
            self.ready.notify_all();
        }
        Ok(discarded)
    }

    fn client_alive(&self, client_id: ClientId) -> bool {
        !self.state.lock().departed.contains(&client_id)
    }

    fn read_chunk(&self, handle: BufferHandle, len: usize) -> Result<Vec<u8>, TransportError> {
        let state = self.state.lock();
        let buffer = state
            .buffers
            .get(&handle)
            .ok_or(TransportError::UnknownBuffer(handle))?;
        if len > buffer.len() {
            return Err(TransportError::ChunkTooLarge {
                len,
                capacity: buffer.len(),
            });
        }
        Ok(buffer[..len].to_vec())
    }

    fn write_chunk(&self, handle: BufferHandle, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > self.buffer_size {
            return Err(TransportError::ChunkTooLarge {
                len: data.len(),
                capacity: self.buffer_size,
            });
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let buffer = state
            .buffers
            .entry(handle)
            .or_insert_with(|| vec![0u8; self.buffer_size]);
        buffer[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn remove_buffer(&self, handle: BufferHandle) -> Result<(), TransportError> {
        self.state.lock().buffers.remove(&handle);
        Ok(())
    }

    fn teardown(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.queue.clear();
        state.buffers.clear();
        drop(state);
        self.ready.notify_all();
        Ok(())
    }
}
