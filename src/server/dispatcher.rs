//! Worker 派发
//!
//! 最后一个分片写入后，会话交给一个独立的阻塞任务：
//! 计算摘要 -> 发送回复 -> 删除临时文件 -> 释放槽位。
//! 主循环不等待任务结束，每轮开始时非阻塞地回收已完成的任务。

use super::capacity::SlotPermit;
use super::registry::UploadSession;
use crate::digest;
use crate::transport::{ClientId, Envelope, ReplyStatus, Transport};
use futures::FutureExt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 单个 worker 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReport {
    /// 摘要已回复
    Delivered { client_id: ClientId, size: u64 },
    /// 摘要计算失败，已回复 DigestFailed
    DigestFailed { client_id: ClientId, reason: String },
    /// 回复发送失败
    ReplyFailed { client_id: ClientId, reason: String },
}

#[derive(Debug)]
struct RunningWorker {
    client_id: ClientId,
    handle: JoinHandle<WorkerReport>,
}

/// Worker 派发器
pub struct WorkerDispatcher {
    runtime: Handle,
    transport: Arc<dyn Transport>,
    workers: Vec<RunningWorker>,
    completed: u64,
    failed: u64,
}

impl WorkerDispatcher {
    pub fn new(runtime: Handle, transport: Arc<dyn Transport>) -> Self {
        Self {
            runtime,
            transport,
            workers: Vec::new(),
            completed: 0,
            failed: 0,
        }
    }

    /// 派发一个已完成的会话，permit 在回复发送且临时文件删除后释放
    pub fn dispatch(&mut self, session: UploadSession, permit: SlotPermit) {
        let client_id = session.client_id;
        let transport = Arc::clone(&self.transport);

        let handle = self.runtime.spawn_blocking(move || {
            let report = finish_upload(transport.as_ref(), &session);
            drop(permit);
            report
        });

        debug!("已派发摘要任务: client_id={}", client_id);
        self.workers.push(RunningWorker { client_id, handle });
    }

    /// 非阻塞回收已结束的任务，返回回收数量
    pub fn reap(&mut self) -> usize {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| w.handle.is_finished());
        self.workers = running;

        let mut reaped = 0;
        for worker in finished {
            let client_id = worker.client_id;
            match worker.handle.now_or_never() {
                Some(Ok(report)) => {
                    self.record(&report);
                    reaped += 1;
                }
                Some(Err(e)) => {
                    // 任务 panic 时 permit 已随栈展开释放
                    error!("摘要任务异常退出: client_id={}, 错误: {}", client_id, e);
                    self.failed += 1;
                    reaped += 1;
                }
                None => {
                    warn!("摘要任务状态不一致，稍后重试回收: client_id={}", client_id);
                }
            }
        }
        reaped
    }

    /// 运行中的任务数
    pub fn running(&self) -> usize {
        self.workers.len()
    }

    /// (成功, 失败) 计数
    pub fn totals(&self) -> (u64, u64) {
        (self.completed, self.failed)
    }

    fn record(&mut self, report: &WorkerReport) {
        match report {
            WorkerReport::Delivered { client_id, size } => {
                self.completed += 1;
                debug!("摘要任务完成: client_id={}, size={}", client_id, size);
            }
            WorkerReport::DigestFailed { client_id, reason }
            | WorkerReport::ReplyFailed { client_id, reason } => {
                self.failed += 1;
                warn!("摘要任务失败: client_id={}, 原因: {}", client_id, reason);
            }
        }
    }
}

/// 计算摘要、回复客户端、删除临时文件
fn finish_upload(transport: &dyn Transport, session: &UploadSession) -> WorkerReport {
    let client_id = session.client_id;
    let path = session.sink.path();

    let (reply, mut report) = match digest::sha256_file(path) {
        Ok(d) => {
            info!(
                "上传完成: client_id={}, size={}, sha256={}",
                client_id, d.size, d.hex
            );
            let size = d.size;
            (
                Envelope::digest_reply(client_id, d.size, d.hex),
                WorkerReport::Delivered { client_id, size },
            )
        }
        Err(e) => {
            error!("计算摘要失败: client_id={}, 错误: {:#}", client_id, e);
            (
                Envelope::rejection(client_id, ReplyStatus::DigestFailed),
                WorkerReport::DigestFailed {
                    client_id,
                    reason: format!("{:#}", e),
                },
            )
        }
    };

    if let Err(e) = transport.send_reply(&reply) {
        error!("发送摘要回复失败: client_id={}, 错误: {}", client_id, e);
        report = WorkerReport::ReplyFailed {
            client_id,
            reason: e.to_string(),
        };
    }

    if let Err(e) = session.sink.remove() {
        warn!("删除临时文件失败: {:?}, 错误: {}", path, e);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::capacity::WorkerCapacity;
    use crate::server::sink::ChunkSink;
    use crate::transport::{MemoryTransport, Wait};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn session(dir: &TempDir, client_id: ClientId, data: Option<&[u8]>) -> UploadSession {
        let sink = ChunkSink::new(dir.path(), client_id, 1);
        if let Some(data) = data {
            sink.write_chunk(0, data).unwrap();
        }
        UploadSession {
            client_id,
            sink,
            received_chunks: 1,
            total_chunks: 1,
            last_activity: Instant::now(),
        }
    }

    fn wait_for_workers(dispatcher: &mut WorkerDispatcher) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while dispatcher.running() > 0 && Instant::now() < deadline {
            dispatcher.reap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(dispatcher.running(), 0);
    }

    #[test]
    fn test_dispatch_replies_and_releases_slot() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new(64));
        let capacity = Arc::new(WorkerCapacity::new(1));
        let mut dispatcher = WorkerDispatcher::new(runtime.handle().clone(), transport.clone());

        let session = session(&dir, 500, Some(b"hello world"));
        let sink_path = session.sink.path().to_path_buf();
        let permit = capacity.try_acquire().unwrap();
        dispatcher.dispatch(session, permit);

        let reply = transport
            .recv_reply(500, Wait::Timeout(Duration::from_secs(5)))
            .unwrap()
            .unwrap();
        assert_eq!(reply.status, ReplyStatus::Digest);
        assert_eq!(reply.digest, digest::sha256_hex(b"hello world"));
        assert_eq!(reply.payload_size, 11);

        wait_for_workers(&mut dispatcher);
        assert_eq!(dispatcher.totals(), (1, 0));
        assert_eq!(capacity.in_flight(), 0);
        assert!(!sink_path.exists());
    }

    #[test]
    fn test_missing_sink_reports_digest_failure() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new(64));
        let capacity = Arc::new(WorkerCapacity::new(1));
        let mut dispatcher = WorkerDispatcher::new(runtime.handle().clone(), transport.clone());

        dispatcher.dispatch(session(&dir, 501, None), capacity.try_acquire().unwrap());

        let reply = transport
            .recv_reply(501, Wait::Timeout(Duration::from_secs(5)))
            .unwrap()
            .unwrap();
        assert_eq!(reply.status, ReplyStatus::DigestFailed);

        wait_for_workers(&mut dispatcher);
        assert_eq!(dispatcher.totals(), (0, 1));
        assert_eq!(capacity.available(), 1);
    }
}
