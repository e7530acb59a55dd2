// 服务端上下文与主循环
//
// 进程内的全部服务端状态都归这里所有：worker 容量、会话表、待处理队列、
// 传输层以及 worker 派发器。主循环运行在独立的阻塞线程上，
// 除了接收请求以外的所有步骤都不阻塞。

use super::backlog::Backlog;
use super::capacity::WorkerCapacity;
use super::control::{ControlDirective, ControlPlane, LimitChange};
use super::dispatcher::WorkerDispatcher;
use super::registry::UploadRegistry;
use super::request::ChunkRequest;
use super::scheduler::AdmissionScheduler;
use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::transport::{is_addressable, ClientId, Envelope, ReplyStatus, Transport, Wait};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

/// 接收失败后的重试间隔
const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 一轮调度的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// 本轮没有收到请求
    Idle,
    /// 非最后分片已写入并确认
    Admitted { client_id: ClientId, chunk_index: u32 },
    /// 最后一个分片已写入，摘要任务已派发
    Dispatched { client_id: ClientId },
    /// 没有空闲槽位，请求进入待处理队列
    Deferred { client_id: ClientId },
    /// 已回复拒绝
    Rejected { client_id: ClientId, status: ReplyStatus },
    /// 已应用控制指令
    Control(LimitChange),
    /// 请求被丢弃（无法回复或传输失败）
    Dropped,
}

enum Inbound {
    Chunk(ChunkRequest),
    Control(ControlDirective),
    Invalid(CycleOutcome),
}

enum IngestError {
    Reject(ReplyStatus),
    Transport(TransportError),
}

/// 服务端上下文
pub struct ServerContext {
    transport: Arc<dyn Transport>,
    capacity: Arc<WorkerCapacity>,
    registry: UploadRegistry,
    scheduler: AdmissionScheduler,
    control: ControlPlane,
    dispatcher: WorkerDispatcher,
    max_chunk_size: usize,
    idle_timeout: Option<Duration>,
    sweep_interval: Duration,
}

impl ServerContext {
    pub fn new(config: &ServerConfig, transport: Arc<dyn Transport>, runtime: Handle) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.sink_dir)
            .with_context(|| format!("无法创建临时文件目录: {:?}", config.sink_dir))?;

        let capacity = Arc::new(WorkerCapacity::new(config.initial_workers));

        info!(
            "服务端上下文已初始化: workers={}, 最大会话数={}, 待处理队列容量={}, 临时目录={:?}",
            config.initial_workers, config.max_sessions, config.backlog_capacity, config.sink_dir
        );

        Ok(Self {
            registry: UploadRegistry::new(config.max_sessions, &config.sink_dir),
            scheduler: AdmissionScheduler::new(config.backlog_capacity, Arc::clone(&capacity)),
            control: ControlPlane::new(Arc::clone(&capacity), config.max_worker_limit),
            dispatcher: WorkerDispatcher::new(runtime, Arc::clone(&transport)),
            capacity,
            transport,
            max_chunk_size: config.max_chunk_size,
            idle_timeout: config.session_idle_timeout(),
            sweep_interval: config.sweep_interval(),
        })
    }

    pub fn capacity(&self) -> &Arc<WorkerCapacity> {
        &self.capacity
    }

    pub fn registry(&self) -> &UploadRegistry {
        &self.registry
    }

    pub fn backlog(&self) -> &Backlog {
        self.scheduler.backlog()
    }

    /// 运行中的摘要任务数
    pub fn running_workers(&self) -> usize {
        self.dispatcher.running()
    }

    /// 非阻塞回收已结束的摘要任务
    pub fn reap_workers(&mut self) -> usize {
        self.dispatcher.reap()
    }

    /// 主循环，直到传输通道关闭
    pub fn run(&mut self) {
        info!("主循环启动");
        loop {
            match self.run_cycle() {
                Ok(outcome) => trace!("调度结果: {:?}", outcome),
                Err(e) if e.is_closed() => {
                    info!("传输通道已关闭，主循环退出");
                    break;
                }
                Err(e) => {
                    error!("接收请求失败: {}", e);
                    std::thread::sleep(RECV_RETRY_DELAY);
                }
            }
        }

        self.dispatcher.reap();
        let (completed, failed) = self.dispatcher.totals();
        info!(
            "主循环已结束: 完成 {} 个上传，失败 {} 个，仍在运行 {} 个",
            completed,
            failed,
            self.dispatcher.running()
        );
    }

    /// 执行一轮调度
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, TransportError> {
        self.dispatcher.reap();
        self.sweep_expired(Instant::now());

        if self.scheduler.should_drain() {
            let arrival = match self.transport.recv_request(Wait::NoWait)? {
                None => None,
                Some(envelope) => match self.classify(envelope) {
                    Inbound::Control(directive) => return Ok(self.apply_control(directive)),
                    Inbound::Chunk(request) => Some(request),
                    // 无效请求已回复，本轮仍处理积压
                    Inbound::Invalid(_) => None,
                },
            };

            return Ok(match self.scheduler.choose(arrival) {
                Some(request) => self.admit(request),
                None => CycleOutcome::Idle,
            });
        }

        let Some(envelope) = self
            .transport
            .recv_request(Wait::Timeout(self.sweep_interval))?
        else {
            return Ok(CycleOutcome::Idle);
        };

        Ok(match self.classify(envelope) {
            Inbound::Control(directive) => self.apply_control(directive),
            Inbound::Invalid(outcome) => outcome,
            Inbound::Chunk(request) if self.capacity.available() == 0 => self.defer(request),
            Inbound::Chunk(request) => self.admit(request),
        })
    }

    /// 回收空闲超时的会话，返回回收数量
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let Some(idle) = self.idle_timeout else {
            return 0;
        };

        let scheduler = &self.scheduler;
        let expired = self
            .registry
            .expire_idle(now, idle, |id| scheduler.has_pending(id));

        for session in &expired {
            warn!(
                "会话空闲超时，已回收: client_id={}, 已收分片 {}/{}",
                session.client_id, session.received_chunks, session.total_chunks
            );
            if let Err(e) = session.sink.remove() {
                warn!("删除临时文件失败: {:?}, 错误: {}", session.sink.path(), e);
            }
            self.discard_stale_replies(session.client_id);
            if self.transport.client_alive(session.client_id) {
                self.reply(&Envelope::rejection(session.client_id, ReplyStatus::Expired));
            } else {
                debug!("客户端进程已退出，不发送超时通知: client_id={}", session.client_id);
            }
        }
        expired.len()
    }

    fn classify(&mut self, envelope: Envelope) -> Inbound {
        let client_id = envelope.client_id;

        if envelope.is_control() {
            return match self.control.parse(&envelope) {
                Ok(directive) => Inbound::Control(directive),
                Err(e) => {
                    warn!("忽略无效控制指令: sender={}, {}", client_id, e);
                    self.reply(&Envelope::rejection(client_id, ReplyStatus::BadRequest));
                    Inbound::Invalid(CycleOutcome::Rejected {
                        client_id,
                        status: ReplyStatus::BadRequest,
                    })
                }
            };
        }

        if !is_addressable(client_id) {
            warn!("丢弃无法回复的分片请求: client_id={}", client_id);
            return Inbound::Invalid(CycleOutcome::Dropped);
        }

        match ChunkRequest::from_envelope(&envelope, self.max_chunk_size) {
            Ok(request) => Inbound::Chunk(request),
            Err(e) => {
                warn!("分片请求不合法: client_id={}, {}", client_id, e);
                Inbound::Invalid(self.reject_chunk(client_id, ReplyStatus::BadRequest))
            }
        }
    }

    fn apply_control(&mut self, directive: ControlDirective) -> CycleOutcome {
        let change = self.control.apply(&directive);
        self.reply(&Envelope::control_ack(directive.sender, change.new as u64));
        CycleOutcome::Control(change)
    }

    fn defer(&mut self, request: ChunkRequest) -> CycleOutcome {
        let client_id = request.client_id;
        match self.scheduler.defer(request) {
            Ok(()) => {
                debug!(
                    "无空闲 worker，请求进入待处理队列: client_id={}, 队列长度={}",
                    client_id,
                    self.scheduler.backlog().len()
                );
                CycleOutcome::Deferred { client_id }
            }
            Err(rejected) => {
                warn!(
                    "待处理队列已满 ({}), 拒绝请求: client_id={}, chunk #{}",
                    self.scheduler.backlog().capacity(),
                    rejected.client_id,
                    rejected.chunk_index
                );
                self.reject_chunk(rejected.client_id, ReplyStatus::BacklogFull)
            }
        }
    }

    /// 占用槽位、写入分片、确认；最后一个分片交给 worker
    fn admit(&mut self, request: ChunkRequest) -> CycleOutcome {
        let client_id = request.client_id;
        let Some(permit) = self.capacity.try_acquire() else {
            return self.defer(request);
        };

        if let Err(e) = self.ingest(&request) {
            drop(permit);
            return match e {
                IngestError::Reject(status) => self.reject_chunk(client_id, status),
                IngestError::Transport(err) => {
                    error!("读取分片数据失败: client_id={}, 错误: {}", client_id, err);
                    CycleOutcome::Dropped
                }
            };
        }

        self.reply(&request.ack());

        if !request.is_final {
            // 非最后分片不跨往返占用槽位
            drop(permit);
            return CycleOutcome::Admitted {
                client_id,
                chunk_index: request.chunk_index,
            };
        }

        match self.registry.close(client_id) {
            Some(session) => {
                info!(
                    "分片接收完毕，派发摘要任务: client_id={}, 分片数={}",
                    client_id, session.received_chunks
                );
                self.dispatcher.dispatch(session, permit);
                self.dispatcher.reap();
                CycleOutcome::Dispatched { client_id }
            }
            None => {
                error!("最后一个分片写入后找不到会话: client_id={}", client_id);
                CycleOutcome::Dropped
            }
        }
    }

    fn ingest(&mut self, request: &ChunkRequest) -> Result<(), IngestError> {
        let now = Instant::now();
        let client_id = request.client_id;

        let session = self
            .registry
            .get_or_create(client_id, request.total_chunks, now)
            .map_err(|e| {
                warn!("拒绝新的上传: client_id={}, {}", client_id, e);
                IngestError::Reject(ReplyStatus::SessionLimit)
            })?;

        if request.chunk_index == 0 {
            if session.received_chunks > 0 {
                info!(
                    "客户端重新开始上传: client_id={}, 丢弃已收分片 {}",
                    client_id, session.received_chunks
                );
            }
            session.restart(request.total_chunks, now);
        }

        session.check_next(request).map_err(|e| {
            warn!("分片请求不合法: client_id={}, {}", client_id, e);
            IngestError::Reject(ReplyStatus::BadRequest)
        })?;

        let data = self
            .transport
            .read_chunk(request.buffer_handle, request.payload_size as usize)
            .map_err(|e| match e {
                TransportError::UnknownBuffer(_) | TransportError::ChunkTooLarge { .. } => {
                    warn!("分片缓冲区不可用: client_id={}, {}", client_id, e);
                    IngestError::Reject(ReplyStatus::BadRequest)
                }
                other => IngestError::Transport(other),
            })?;

        session
            .sink
            .write_chunk(request.chunk_index, &data)
            .map_err(|e| {
                error!("client_id={}: {}", client_id, e);
                IngestError::Reject(ReplyStatus::SinkFailed)
            })?;

        if request.chunk_index == 0 {
            info!(
                "开始接收上传: client_id={}, 总分片数={}",
                client_id, request.total_chunks
            );
        }
        session.record_chunk(now);
        Ok(())
    }

    /// 回复拒绝并丢弃该客户端的会话
    fn reject_chunk(&mut self, client_id: ClientId, status: ReplyStatus) -> CycleOutcome {
        if let Some(session) = self.registry.close(client_id) {
            if let Err(e) = session.sink.remove() {
                warn!("删除临时文件失败: {:?}, 错误: {}", session.sink.path(), e);
            }
        }
        self.discard_stale_replies(client_id);
        self.reply(&Envelope::rejection(client_id, status));
        CycleOutcome::Rejected { client_id, status }
    }

    fn reply(&self, envelope: &Envelope) {
        if !is_addressable(envelope.client_id) {
            debug!("跳过无法投递的回复: client_id={}", envelope.client_id);
            return;
        }
        match self.transport.send_reply(envelope) {
            Ok(()) => {}
            Err(TransportError::QueueFull) => warn!(
                "消息队列已满，丢弃回复: client_id={}, status={:?}",
                envelope.client_id, envelope.status
            ),
            Err(e) => error!(
                "发送回复失败: client_id={}, status={:?}, 错误: {}",
                envelope.client_id, envelope.status, e
            ),
        }
    }

    /// 取走发往该客户端但无人读取的回复，避免长期占用队列空间
    fn discard_stale_replies(&self, client_id: ClientId) {
        match self.transport.discard_replies(client_id) {
            Ok(0) => {}
            Ok(n) => debug!("已丢弃 {} 条未读取的回复: client_id={}", n, client_id),
            Err(e) => warn!("清理未读取的回复失败: client_id={}, 错误: {}", client_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_hex;
    use crate::transport::MemoryTransport;
    use tempfile::TempDir;

    struct Harness {
        context: ServerContext,
        transport: Arc<MemoryTransport>,
        dir: TempDir,
        _runtime: tokio::runtime::Runtime,
    }

    fn harness(configure: impl FnOnce(&mut ServerConfig)) -> Harness {
        build_harness(configure, None)
    }

    /// 消息队列最多容纳 `limit` 条消息
    fn harness_with_queue_limit(limit: usize) -> Harness {
        build_harness(|_| {}, Some(limit))
    }

    fn build_harness(
        configure: impl FnOnce(&mut ServerConfig),
        queue_limit: Option<usize>,
    ) -> Harness {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let mut config = ServerConfig {
            sink_dir: dir.path().to_path_buf(),
            sweep_interval_ms: 10,
            max_chunk_size: 64,
            ..Default::default()
        };
        configure(&mut config);

        let mut transport = MemoryTransport::new(config.max_chunk_size);
        if let Some(limit) = queue_limit {
            transport = transport.with_queue_limit(limit);
        }
        let transport = Arc::new(transport);
        let context =
            ServerContext::new(&config, transport.clone(), runtime.handle().clone()).unwrap();
        Harness {
            context,
            transport,
            dir,
            _runtime: runtime,
        }
    }

    impl Harness {
        fn send_chunk(&self, client_id: ClientId, data: &[u8], index: u32, total: u32) {
            self.transport.write_chunk(client_id, data).unwrap();
            self.transport
                .send(&Envelope::chunk(client_id, client_id, data.len() as u64, index, total))
                .unwrap();
        }

        fn cycle(&mut self) -> CycleOutcome {
            self.context.run_cycle().unwrap()
        }

        fn next_reply(&self, client_id: ClientId) -> Envelope {
            self.transport
                .recv_reply(client_id, Wait::Timeout(Duration::from_secs(5)))
                .unwrap()
                .expect("no reply")
        }

        fn wait_for_workers(&mut self) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.context.running_workers() > 0 && Instant::now() < deadline {
                self.context.reap_workers();
                std::thread::sleep(Duration::from_millis(5));
            }
            assert_eq!(self.context.running_workers(), 0);
        }
    }

    #[test]
    fn test_three_chunk_upload() {
        let mut h = harness(|_| {});
        let client = 4321;
        let chunks: [&[u8]; 3] = [b"abcd", b"efgh", b"ij"];

        for (i, chunk) in chunks.iter().enumerate() {
            h.send_chunk(client, chunk, i as u32, 3);
            let outcome = h.cycle();
            if i < 2 {
                assert_eq!(
                    outcome,
                    CycleOutcome::Admitted {
                        client_id: client,
                        chunk_index: i as u32
                    }
                );
            } else {
                assert_eq!(outcome, CycleOutcome::Dispatched { client_id: client });
            }

            let ack = h.next_reply(client);
            assert_eq!(ack.status, ReplyStatus::Ack);
            assert_eq!(ack.chunk_index, i as u32);
        }

        let reply = h.next_reply(client);
        assert_eq!(reply.status, ReplyStatus::Digest);
        assert_eq!(reply.digest, sha256_hex(b"abcdefghij"));
        assert_eq!(reply.payload_size, 10);

        h.wait_for_workers();
        assert!(h.context.registry().is_empty());
        assert_eq!(h.context.capacity().in_flight(), 0);
        assert!(h.transport.drain_replies(client).is_empty());
    }

    #[test]
    fn test_zero_capacity_holds_requests_until_raised() {
        let mut h = harness(|c| c.initial_workers = 0);

        h.send_chunk(500, b"hello", 0, 1);
        assert_eq!(h.cycle(), CycleOutcome::Deferred { client_id: 500 });
        assert!(h.transport.drain_replies(500).is_empty());

        h.transport.send(&Envelope::control(300, 1)).unwrap();
        assert_eq!(
            h.cycle(),
            CycleOutcome::Control(LimitChange { old: 0, new: 1 })
        );
        let ack = h.next_reply(300);
        assert_eq!(ack.status, ReplyStatus::ControlAck);
        assert_eq!(ack.payload_size, 1);

        assert_eq!(h.cycle(), CycleOutcome::Dispatched { client_id: 500 });
        assert_eq!(h.next_reply(500).status, ReplyStatus::Ack);
        assert_eq!(h.next_reply(500).digest, sha256_hex(b"hello"));
        assert!(h.context.backlog().is_empty());
    }

    #[test]
    fn test_admission_prefers_largest_pending() {
        let mut h = harness(|c| c.initial_workers = 0);
        for (client, size) in [(101, 10usize), (102, 50), (103, 30)] {
            h.send_chunk(client, &vec![1u8; size], 0, 2);
            assert_eq!(h.cycle(), CycleOutcome::Deferred { client_id: client });
        }

        h.context.capacity().set_limit(1);
        h.send_chunk(104, &[2u8; 20], 0, 2);

        assert_eq!(
            h.cycle(),
            CycleOutcome::Admitted {
                client_id: 102,
                chunk_index: 0
            }
        );
        let remaining: Vec<u64> = h.context.backlog().iter().map(|r| r.payload_size).collect();
        assert_eq!(remaining, vec![10, 30, 20]);
    }

    #[test]
    fn test_backlog_overflow_rejects_newest() {
        let mut h = harness(|c| {
            c.initial_workers = 0;
            c.backlog_capacity = 1;
        });

        h.send_chunk(101, b"aaaa", 0, 1);
        assert_eq!(h.cycle(), CycleOutcome::Deferred { client_id: 101 });
        h.send_chunk(102, b"bbbbbbbb", 0, 1);
        assert_eq!(
            h.cycle(),
            CycleOutcome::Rejected {
                client_id: 102,
                status: ReplyStatus::BacklogFull
            }
        );

        assert_eq!(h.next_reply(102).status, ReplyStatus::BacklogFull);
        let pending: Vec<_> = h.context.backlog().iter().map(|r| r.client_id).collect();
        assert_eq!(pending, vec![101]);
    }

    #[test]
    fn test_session_limit() {
        let mut h = harness(|c| c.max_sessions = 1);

        h.send_chunk(101, b"aa", 0, 2);
        assert!(matches!(h.cycle(), CycleOutcome::Admitted { .. }));
        h.send_chunk(102, b"bb", 0, 2);
        assert_eq!(
            h.cycle(),
            CycleOutcome::Rejected {
                client_id: 102,
                status: ReplyStatus::SessionLimit
            }
        );
        assert!(h.context.registry().get(101).is_some());
        assert_eq!(h.context.capacity().in_flight(), 0);
    }

    #[test]
    fn test_out_of_order_chunk_discards_session() {
        let mut h = harness(|_| {});

        h.send_chunk(101, b"aa", 0, 3);
        h.cycle();
        let sink = h.context.registry().get(101).unwrap().sink.clone();
        assert!(sink.path().exists());

        h.send_chunk(101, b"cc", 2, 3);
        assert_eq!(
            h.cycle(),
            CycleOutcome::Rejected {
                client_id: 101,
                status: ReplyStatus::BadRequest
            }
        );
        assert!(h.context.registry().get(101).is_none());
        assert!(!sink.path().exists());
    }

    #[test]
    fn test_first_chunk_restarts_session() {
        let mut h = harness(|_| {});

        h.send_chunk(101, b"stale", 0, 2);
        h.cycle();
        h.send_chunk(101, b"ab", 0, 1);
        assert_eq!(h.cycle(), CycleOutcome::Dispatched { client_id: 101 });

        let replies: Vec<_> = (0..3).map(|_| h.next_reply(101)).collect();
        assert_eq!(replies[2].status, ReplyStatus::Digest);
        assert_eq!(replies[2].digest, sha256_hex(b"ab"));
    }

    #[test]
    fn test_invalid_requests() {
        let mut h = harness(|c| c.max_worker_limit = 8);

        // 超过缓冲区大小
        h.transport
            .send(&Envelope::chunk(101, 101, 65, 0, 1))
            .unwrap();
        assert_eq!(
            h.cycle(),
            CycleOutcome::Rejected {
                client_id: 101,
                status: ReplyStatus::BadRequest
            }
        );

        // 缓冲区不存在
        h.transport.send(&Envelope::chunk(102, 102, 4, 0, 1)).unwrap();
        assert_eq!(
            h.cycle(),
            CycleOutcome::Rejected {
                client_id: 102,
                status: ReplyStatus::BadRequest
            }
        );

        // 客户端标识与请求类型冲突
        h.transport.send(&Envelope::chunk(50, 50, 0, 0, 1)).unwrap();
        assert_eq!(h.cycle(), CycleOutcome::Dropped);

        // 超过最大上限的控制指令
        h.transport.send(&Envelope::control(300, 9)).unwrap();
        assert_eq!(
            h.cycle(),
            CycleOutcome::Rejected {
                client_id: 300,
                status: ReplyStatus::BadRequest
            }
        );
        assert_eq!(h.context.capacity().limit(), 5);
        assert_eq!(h.context.capacity().in_flight(), 0);
    }

    #[test]
    fn test_idle_sessions_expire() {
        let mut h = harness(|c| c.session_idle_timeout_secs = 300);

        h.send_chunk(101, b"aa", 0, 2);
        h.cycle();
        assert_eq!(h.next_reply(101).status, ReplyStatus::Ack);
        let sink = h.context.registry().get(101).unwrap().sink.clone();

        assert_eq!(h.context.sweep_expired(Instant::now()), 0);
        assert_eq!(
            h.context
                .sweep_expired(Instant::now() + Duration::from_secs(301)),
            1
        );
        assert!(h.context.registry().is_empty());
        assert!(!sink.path().exists());
        assert_eq!(h.next_reply(101).status, ReplyStatus::Expired);
    }

    #[test]
    fn test_idle_timeout_disabled() {
        let mut h = harness(|c| c.session_idle_timeout_secs = 0);

        h.send_chunk(101, b"aa", 0, 2);
        h.cycle();
        assert_eq!(
            h.context
                .sweep_expired(Instant::now() + Duration::from_secs(100_000)),
            0
        );
        assert!(h.context.registry().get(101).is_some());
    }

    #[test]
    fn test_control_while_draining_skips_scheduling() {
        let mut h = harness(|c| c.initial_workers = 0);
        h.send_chunk(101, b"aaaa", 0, 2);
        assert_eq!(h.cycle(), CycleOutcome::Deferred { client_id: 101 });

        h.context.capacity().set_limit(1);
        h.transport.send(&Envelope::control(300, 2)).unwrap();
        assert_eq!(
            h.cycle(),
            CycleOutcome::Control(LimitChange { old: 1, new: 2 })
        );
        assert_eq!(h.next_reply(300).status, ReplyStatus::ControlAck);
        let pending: Vec<_> = h.context.backlog().iter().map(|r| r.client_id).collect();
        assert_eq!(pending, vec![101]);
        assert!(h.transport.drain_replies(101).is_empty());

        assert_eq!(
            h.cycle(),
            CycleOutcome::Admitted {
                client_id: 101,
                chunk_index: 0
            }
        );
        assert!(h.context.backlog().is_empty());
    }

    #[test]
    fn test_invalid_control_while_draining_still_schedules() {
        let mut h = harness(|c| {
            c.initial_workers = 0;
            c.max_worker_limit = 8;
        });
        h.send_chunk(101, b"aaaa", 0, 2);
        assert_eq!(h.cycle(), CycleOutcome::Deferred { client_id: 101 });

        h.context.capacity().set_limit(1);
        h.transport.send(&Envelope::control(300, 9)).unwrap();
        assert_eq!(
            h.cycle(),
            CycleOutcome::Admitted {
                client_id: 101,
                chunk_index: 0
            }
        );
        assert_eq!(h.next_reply(300).status, ReplyStatus::BadRequest);
        assert_eq!(h.context.capacity().limit(), 1);
        assert!(h.context.backlog().is_empty());
    }

    #[test]
    fn test_sink_failure_discards_session() {
        let mut h = harness(|_| {});
        h.send_chunk(101, b"aa", 0, 3);
        assert!(matches!(h.cycle(), CycleOutcome::Admitted { .. }));
        assert_eq!(h.next_reply(101).status, ReplyStatus::Ack);

        std::fs::remove_dir_all(h.dir.path()).unwrap();
        h.send_chunk(101, b"bb", 1, 3);
        assert_eq!(
            h.cycle(),
            CycleOutcome::Rejected {
                client_id: 101,
                status: ReplyStatus::SinkFailed
            }
        );
        assert_eq!(h.next_reply(101).status, ReplyStatus::SinkFailed);
        assert!(h.context.registry().get(101).is_none());
        assert_eq!(h.context.capacity().in_flight(), 0);
    }

    #[test]
    fn test_full_queue_drops_digest_reply() {
        let mut h = harness_with_queue_limit(2);
        h.send_chunk(101, b"abc", 0, 1);
        h.transport
            .send_reply(&Envelope::rejection(4242, ReplyStatus::Expired))
            .unwrap();

        // 取走请求后回复 Ack 占满队列，worker 的摘要回复被丢弃
        assert_eq!(h.cycle(), CycleOutcome::Dispatched { client_id: 101 });
        h.wait_for_workers();
        assert_eq!(h.context.capacity().in_flight(), 0);
        assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 0);
        assert_eq!(h.transport.queued(), 2);

        let started = Instant::now();
        assert_eq!(h.cycle(), CycleOutcome::Idle);
        assert!(started.elapsed() < Duration::from_secs(1));

        let replies = h.transport.drain_replies(101);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status, ReplyStatus::Ack);
    }

    #[test]
    fn test_expiry_discards_unread_replies() {
        let mut h = harness_with_queue_limit(2);
        h.send_chunk(101, b"aa", 0, 2);
        assert!(matches!(h.cycle(), CycleOutcome::Admitted { .. }));
        h.transport
            .send_reply(&Envelope::rejection(4242, ReplyStatus::Expired))
            .unwrap();
        assert_eq!(h.transport.queued(), 2);

        assert_eq!(
            h.context
                .sweep_expired(Instant::now() + Duration::from_secs(301)),
            1
        );
        let replies = h.transport.drain_replies(101);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status, ReplyStatus::Expired);
    }

    #[test]
    fn test_expiry_skips_departed_client() {
        let mut h = harness(|_| {});
        h.send_chunk(101, b"aa", 0, 2);
        h.cycle();
        h.transport.mark_departed(101);

        assert_eq!(
            h.context
                .sweep_expired(Instant::now() + Duration::from_secs(301)),
            1
        );
        assert!(h.transport.drain_replies(101).is_empty());
        assert_eq!(h.transport.queued(), 0);
    }

    #[test]
    fn test_run_exits_on_teardown() {
        let mut h = harness(|_| {});
        let transport = h.transport.clone();
        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            transport.teardown().unwrap();
        });

        h.context.run();
        closer.join().unwrap();
    }
}
