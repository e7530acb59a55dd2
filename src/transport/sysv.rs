// System V IPC 传输实现
//
// - 消息队列：msgget / msgsnd / msgrcv / msgctl
// - 共享内存：shmget / shmat / shmdt / shmctl
// - 缓冲区锁：单个二值信号量，semop 带 SEM_UNDO，持有者异常退出时由内核归还
//
// 每个客户端使用自己的共享内存段（键 = handle），服务端只读取。
// 服务端额外创建一个主共享内存段，在关闭时与消息队列、信号量一并移除。

use super::{is_addressable, BufferHandle, ClientId, Envelope, ReplyStatus, Transport, Wait};
use super::{CONTROL_MESSAGE_TYPE, DATA_MESSAGE_TYPE, DIGEST_HEX_LEN};
use crate::config::IpcConfig;
use crate::error::TransportError;
use libc::{c_int, c_long, c_short, c_ushort, c_void};
use std::mem::size_of;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 轮询接收的初始间隔，每次落空后翻倍
const POLL_INTERVAL_MIN: Duration = Duration::from_millis(1);
/// 轮询接收的最大间隔
const POLL_INTERVAL_MAX: Duration = Duration::from_millis(25);

/// 缓冲区锁在信号量集中的序号
const SEM_BUFFER_LOCK: c_ushort = 0;

/// 消息队列中的定长消息
#[repr(C)]
#[derive(Clone, Copy)]
struct RawMessage {
    mtype: c_long,
    client_id: i32,
    status: u8,
    payload_size: u64,
    digest: [u8; DIGEST_HEX_LEN + 1],
    chunk_index: u32,
    total_chunks: u32,
    is_final: i32,
    buffer_handle: i32,
}

/// msgsnd / msgrcv 的消息体长度（不含 mtype）
const RAW_BODY_SIZE: usize = size_of::<RawMessage>() - size_of::<c_long>();

impl RawMessage {
    fn zeroed() -> Self {
        Self {
            mtype: 0,
            client_id: 0,
            status: 0,
            payload_size: 0,
            digest: [0u8; DIGEST_HEX_LEN + 1],
            chunk_index: 0,
            total_chunks: 0,
            is_final: 0,
            buffer_handle: 0,
        }
    }

    fn from_envelope(envelope: &Envelope) -> Self {
        let mut raw = Self::zeroed();
        raw.mtype = envelope.mtype as c_long;
        raw.client_id = envelope.client_id;
        raw.status = envelope.status as u8;
        raw.payload_size = envelope.payload_size;
        let digest = envelope.digest.as_bytes();
        let len = digest.len().min(DIGEST_HEX_LEN);
        raw.digest[..len].copy_from_slice(&digest[..len]);
        raw.chunk_index = envelope.chunk_index;
        raw.total_chunks = envelope.total_chunks;
        raw.is_final = envelope.is_final as i32;
        raw.buffer_handle = envelope.buffer_handle;
        raw
    }

    fn into_envelope(self) -> Envelope {
        let digest_len = self
            .digest
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DIGEST_HEX_LEN);
        Envelope {
            mtype: self.mtype as i64,
            client_id: self.client_id,
            status: ReplyStatus::from_u8(self.status).unwrap_or_default(),
            payload_size: self.payload_size,
            digest: String::from_utf8_lossy(&self.digest[..digest_len]).into_owned(),
            chunk_index: self.chunk_index,
            total_chunks: self.total_chunks,
            is_final: self.is_final != 0,
            buffer_handle: self.buffer_handle,
        }
    }
}

fn last_errno() -> c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// 资源被移除后的 errno 统一映射为 Closed
fn map_errno(op: &'static str) -> TransportError {
    match last_errno() {
        libc::EIDRM | libc::EINVAL => TransportError::Closed,
        _ => TransportError::os(op),
    }
}

// =====================================================
// 消息队列
// =====================================================

#[derive(Debug)]
struct MessageQueue {
    id: c_int,
}

impl MessageQueue {
    fn get(key: i32, flags: c_int) -> Result<Self, TransportError> {
        let id = unsafe { libc::msgget(key, flags) };
        if id == -1 {
            return Err(TransportError::os("msgget"));
        }
        Ok(Self { id })
    }

    /// nowait 时队列已满返回 QueueFull，否则等待空间
    fn send(&self, raw: &RawMessage, nowait: bool) -> Result<(), TransportError> {
        let flags = if nowait { libc::IPC_NOWAIT } else { 0 };
        loop {
            let ret = unsafe {
                libc::msgsnd(
                    self.id,
                    raw as *const RawMessage as *const c_void,
                    RAW_BODY_SIZE,
                    flags,
                )
            };
            if ret == 0 {
                return Ok(());
            }
            match last_errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Err(TransportError::QueueFull),
                _ => return Err(map_errno("msgsnd")),
            }
        }
    }

    /// msgtyp 语义与 msgrcv 一致：正数精确匹配，负数取类型 <= |msgtyp| 的最小类型
    fn receive(&self, msgtyp: c_long, nowait: bool) -> Result<Option<RawMessage>, TransportError> {
        let flags = if nowait { libc::IPC_NOWAIT } else { 0 };
        loop {
            let mut raw = RawMessage::zeroed();
            let ret = unsafe {
                libc::msgrcv(
                    self.id,
                    &mut raw as *mut RawMessage as *mut c_void,
                    RAW_BODY_SIZE,
                    msgtyp,
                    flags,
                )
            };
            if ret >= 0 {
                return Ok(Some(raw));
            }
            match last_errno() {
                libc::ENOMSG => return Ok(None),
                libc::EINTR => continue,
                _ => return Err(map_errno("msgrcv")),
            }
        }
    }

    fn remove(&self) -> Result<(), TransportError> {
        let ret = unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if ret == -1 {
            return Err(TransportError::os("msgctl(IPC_RMID)"));
        }
        Ok(())
    }
}

// =====================================================
// 缓冲区锁（二值信号量）
// =====================================================

#[derive(Debug)]
struct BufferLock {
    id: c_int,
}

impl BufferLock {
    /// 创建信号量集并初始化为 1；已存在时复用并重置
    fn create(key: i32) -> Result<Self, TransportError> {
        let mut id = unsafe { libc::semget(key, 1, libc::IPC_CREAT | libc::IPC_EXCL | 0o666) };
        if id == -1 {
            if last_errno() != libc::EEXIST {
                return Err(TransportError::os("semget"));
            }
            id = unsafe { libc::semget(key, 1, 0) };
            if id == -1 {
                return Err(TransportError::os("semget"));
            }
            warn!("信号量集已存在，复用并重置: key={:#x}", key);
        }

        let ret = unsafe { libc::semctl(id, SEM_BUFFER_LOCK as c_int, libc::SETVAL, 1 as c_int) };
        if ret == -1 {
            return Err(TransportError::os("semctl(SETVAL)"));
        }
        Ok(Self { id })
    }

    fn open(key: i32) -> Result<Self, TransportError> {
        let id = unsafe { libc::semget(key, 1, 0) };
        if id == -1 {
            return Err(TransportError::os("semget"));
        }
        Ok(Self { id })
    }

    fn op(&self, delta: c_short) -> Result<(), TransportError> {
        let mut op = libc::sembuf {
            sem_num: SEM_BUFFER_LOCK,
            sem_op: delta,
            sem_flg: libc::SEM_UNDO as c_short,
        };
        loop {
            let ret = unsafe { libc::semop(self.id, &mut op, 1) };
            if ret == 0 {
                return Ok(());
            }
            if last_errno() != libc::EINTR {
                return Err(map_errno("semop"));
            }
        }
    }

    fn lock(&self) -> Result<BufferLockGuard<'_>, TransportError> {
        self.op(-1)?;
        Ok(BufferLockGuard { lock: self })
    }

    fn remove(&self) -> Result<(), TransportError> {
        let ret = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        if ret == -1 {
            return Err(TransportError::os("semctl(IPC_RMID)"));
        }
        Ok(())
    }
}

/// 缓冲区锁守卫（RAII），drop 时释放
struct BufferLockGuard<'a> {
    lock: &'a BufferLock,
}

impl Drop for BufferLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.op(1) {
            warn!("释放缓冲区锁失败: {}", e);
        }
    }
}

// =====================================================
// 共享内存段
// =====================================================

/// 已 attach 的共享内存段，drop 时 detach
struct AttachedSegment {
    addr: *mut c_void,
    size: usize,
}

impl AttachedSegment {
    fn attach(id: c_int, size: usize) -> Result<Self, TransportError> {
        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(TransportError::os("shmat"));
        }
        Ok(Self { addr, size })
    }

    fn read(&self, len: usize) -> Vec<u8> {
        let len = len.min(self.size);
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr as *const u8, out.as_mut_ptr(), len);
        }
        out
    }

    fn write(&self, data: &[u8]) {
        let len = data.len().min(self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.addr as *mut u8, len);
        }
    }
}

impl Drop for AttachedSegment {
    fn drop(&mut self) {
        if unsafe { libc::shmdt(self.addr) } == -1 {
            warn!("shmdt 失败: {}", std::io::Error::last_os_error());
        }
    }
}

fn segment_get(key: i32, size: usize, create: bool) -> Result<c_int, TransportError> {
    let flags = if create { libc::IPC_CREAT | 0o666 } else { 0o666 };
    let id = unsafe { libc::shmget(key, size, flags) };
    if id == -1 {
        if !create && last_errno() == libc::ENOENT {
            return Err(TransportError::UnknownBuffer(key));
        }
        return Err(TransportError::os("shmget"));
    }
    Ok(id)
}

fn segment_remove(id: c_int) -> Result<(), TransportError> {
    let ret = unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
    if ret == -1 {
        return Err(TransportError::os("shmctl(IPC_RMID)"));
    }
    Ok(())
}

// =====================================================
// SysV 传输
// =====================================================

/// System V IPC 传输
#[derive(Debug)]
pub struct SysvTransport {
    queue: MessageQueue,
    lock: BufferLock,
    /// 服务端主共享内存段（仅服务端持有）
    primary_segment: Option<c_int>,
    /// 每个共享内存段的大小
    buffer_size: usize,
}

impl SysvTransport {
    /// 服务端：创建全部 IPC 资源
    pub fn create(ipc: &IpcConfig, buffer_size: usize) -> Result<Self, TransportError> {
        let queue = MessageQueue::get(ipc.msg_key, libc::IPC_CREAT | 0o666)?;
        let primary = segment_get(ipc.shm_key, buffer_size, true)?;
        let lock = BufferLock::create(ipc.sem_key)?;

        info!(
            "IPC 资源已创建: msgid={}, shmid={}, semid={}, 缓冲区大小={}",
            queue.id, primary, lock.id, buffer_size
        );

        Ok(Self {
            queue,
            lock,
            primary_segment: Some(primary),
            buffer_size,
        })
    }

    /// 客户端：打开服务端已创建的资源
    pub fn open(ipc: &IpcConfig, buffer_size: usize) -> Result<Self, TransportError> {
        let queue = MessageQueue::get(ipc.msg_key, 0)?;
        let lock = BufferLock::open(ipc.sem_key)?;
        debug!("已连接 IPC 资源: msgid={}, semid={}", queue.id, lock.id);

        Ok(Self {
            queue,
            lock,
            primary_segment: None,
            buffer_size,
        })
    }

    /// `blocking_type` 为 None 时阻塞接收也走轮询，用于必须保持优先级的请求接收
    fn receive_typed(
        &self,
        wait: Wait,
        try_once: impl Fn() -> Result<Option<RawMessage>, TransportError>,
        blocking_type: Option<c_long>,
    ) -> Result<Option<Envelope>, TransportError> {
        let deadline = match wait {
            Wait::NoWait => return Ok(try_once()?.map(RawMessage::into_envelope)),
            Wait::Blocking => match blocking_type {
                Some(mtype) => {
                    let raw = match try_once()? {
                        Some(raw) => Some(raw),
                        None => self.queue.receive(mtype, false)?,
                    };
                    return Ok(raw.map(RawMessage::into_envelope));
                }
                None => None,
            },
            Wait::Timeout(duration) => Some(Instant::now() + duration),
        };

        let mut interval = POLL_INTERVAL_MIN;
        loop {
            if let Some(raw) = try_once()? {
                return Ok(Some(raw.into_envelope()));
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    interval.min(deadline - now)
                }
                None => interval,
            };
            std::thread::sleep(pause);
            interval = (interval * 2).min(POLL_INTERVAL_MAX);
        }
    }
}

impl Transport for SysvTransport {
    fn recv_request(&self, wait: Wait) -> Result<Option<Envelope>, TransportError> {
        let try_once = || match self.queue.receive(CONTROL_MESSAGE_TYPE as c_long, true)? {
            Some(raw) => Ok(Some(raw)),
            None => self.queue.receive(DATA_MESSAGE_TYPE as c_long, true),
        };
        // msgrcv(-99) 会先返回类型 1，阻塞等待同样轮询以保证控制指令优先
        self.receive_typed(wait, try_once, None)
    }

    fn recv_reply(
        &self,
        client_id: ClientId,
        wait: Wait,
    ) -> Result<Option<Envelope>, TransportError> {
        let mtype = client_id as c_long;
        self.receive_typed(wait, || self.queue.receive(mtype, true), Some(mtype))
    }

    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.queue.send(&RawMessage::from_envelope(envelope), false)
    }

    fn send_reply(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.queue.send(&RawMessage::from_envelope(envelope), true)
    }

    fn discard_replies(&self, client_id: ClientId) -> Result<usize, TransportError> {
        // 类型 <= 99 是请求，不能按客户端标识取走
        if !is_addressable(client_id) {
            return Ok(0);
        }
        let mut discarded = 0;
        while self.queue.receive(client_id as c_long, true)?.is_some() {
            discarded += 1;
        }
        Ok(discarded)
    }

    /// 客户端标识即客户端进程号，kill(pid, 0) 报告 ESRCH 说明进程已退出
    fn client_alive(&self, client_id: ClientId) -> bool {
        if client_id <= 0 {
            return true;
        }
        let ret = unsafe { libc::kill(client_id as libc::pid_t, 0) };
        ret == 0 || last_errno() != libc::ESRCH
    }

    fn read_chunk(&self, handle: BufferHandle, len: usize) -> Result<Vec<u8>, TransportError> {
        if len > self.buffer_size {
            return Err(TransportError::ChunkTooLarge {
                len,
                capacity: self.buffer_size,
            });
        }
        let _guard = self.lock.lock()?;
        let id = segment_get(handle, self.buffer_size, false)?;
        let segment = AttachedSegment::attach(id, self.buffer_size)?;
        Ok(segment.read(len))
    }

    fn write_chunk(&self, handle: BufferHandle, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > self.buffer_size {
            return Err(TransportError::ChunkTooLarge {
                len: data.len(),
                capacity: self.buffer_size,
            });
        }
        let _guard = self.lock.lock()?;
        let id = segment_get(handle, self.buffer_size, true)?;
        let segment = AttachedSegment::attach(id, self.buffer_size)?;
        segment.write(data);
        Ok(())
    }

    fn remove_buffer(&self, handle: BufferHandle) -> Result<(), TransportError> {
        match segment_get(handle, 0, false) {
            Ok(id) => segment_remove(id),
            Err(TransportError::UnknownBuffer(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn teardown(&self) -> Result<(), TransportError> {
        let mut first_error = None;

        if let Err(e) = self.queue.remove() {
            warn!("移除消息队列失败: {}", e);
            first_error.get_or_insert(e);
        }
        if let Some(id) = self.primary_segment {
            if let Err(e) = segment_remove(id) {
                warn!("移除共享内存失败: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.lock.remove() {
            warn!("移除信号量集失败: {}", e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("IPC 资源已全部移除");
                Ok(())
            }
        }
    }
}
