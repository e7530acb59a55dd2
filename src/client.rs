// 客户端
//
// 上传流程：按缓冲区大小切分文件，每个分片先写入自己的缓冲区再发送信封，
// 收到该分片的确认后才发送下一个；最后等待摘要回复。
// 空文件作为一个空的最后分片发送。

use crate::error::ClientError;
use crate::transport::{
    is_addressable, BufferHandle, ClientId, Envelope, ReplyStatus, Transport, Wait,
};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 上传结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// 十六进制 SHA-256
    pub digest: String,
    /// 服务端计算摘要的字节数
    pub size: u64,
    /// 发送的分片数
    pub chunks: u32,
}

/// 分片上传客户端
pub struct UploadClient {
    transport: Arc<dyn Transport>,
    client_id: ClientId,
    buffer: BufferHandle,
    chunk_size: usize,
    /// None 表示一直等待
    reply_timeout: Option<Duration>,
}

impl UploadClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        client_id: ClientId,
        buffer: BufferHandle,
        chunk_size: usize,
    ) -> Result<Self, ClientError> {
        if !is_addressable(client_id) {
            return Err(ClientError::InvalidClientId(client_id));
        }
        Ok(Self {
            transport,
            client_id,
            buffer,
            chunk_size: chunk_size.max(1),
            reply_timeout: None,
        })
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    pub fn upload_bytes(&self, data: &[u8]) -> Result<UploadReceipt, ClientError> {
        self.upload_reader(data, data.len() as u64)
    }

    pub fn upload_file(&self, path: &Path) -> Result<UploadReceipt, ClientError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        info!("开始上传: {:?} ({} 字节)", path, len);
        self.upload_reader(BufReader::new(file), len)
    }

    /// 从 reader 读取恰好 `len` 字节并上传
    pub fn upload_reader<R: Read>(&self, reader: R, len: u64) -> Result<UploadReceipt, ClientError> {
        let result = self.transfer(reader, len);
        if matches!(result, Err(ClientError::Timeout(_))) {
            // 放弃等待前取走已到达的回复，不留在共享队列中
            match self.transport.discard_replies(self.client_id) {
                Ok(n) if n > 0 => debug!("已丢弃 {} 条迟到的回复", n),
                _ => {}
            }
        }
        if let Err(e) = self.transport.remove_buffer(self.buffer) {
            debug!("删除分片缓冲区失败: handle={}, {}", self.buffer, e);
        }
        result
    }

    fn transfer<R: Read>(&self, mut reader: R, len: u64) -> Result<UploadReceipt, ClientError> {
        let total = chunk_count(len, self.chunk_size)?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut remaining = len;

        for index in 0..total {
            let n = remaining.min(self.chunk_size as u64) as usize;
            reader.read_exact(&mut buf[..n])?;
            remaining -= n as u64;

            self.transport.write_chunk(self.buffer, &buf[..n])?;
            self.transport.send(&Envelope::chunk(
                self.client_id,
                self.buffer,
                n as u64,
                index,
                total,
            ))?;

            let reply = self.wait_reply()?;
            match reply.status {
                ReplyStatus::Ack if reply.chunk_index == index => {
                    debug!("分片 #{}/{} 已确认 ({} 字节)", index + 1, total, n);
                }
                status if status.is_rejection() => return Err(ClientError::Rejected(status)),
                status => return Err(ClientError::UnexpectedReply(status)),
            }
        }

        let reply = self.wait_reply()?;
        match reply.status {
            ReplyStatus::Digest => Ok(UploadReceipt {
                digest: reply.digest,
                size: reply.payload_size,
                chunks: total,
            }),
            status if status.is_rejection() => Err(ClientError::Rejected(status)),
            status => Err(ClientError::UnexpectedReply(status)),
        }
    }

    fn wait_reply(&self) -> Result<Envelope, ClientError> {
        let wait = match self.reply_timeout {
            Some(timeout) => Wait::Timeout(timeout),
            None => Wait::Blocking,
        };
        self.transport
            .recv_reply(self.client_id, wait)?
            .ok_or(ClientError::Timeout(self.client_id))
    }
}

/// 分片数，空文件也占一个分片
fn chunk_count(len: u64, chunk_size: usize) -> Result<u32, ClientError> {
    let size = chunk_size as u64;
    let count = (len / size + u64::from(len % size != 0)).max(1);
    u32::try_from(count).map_err(|_| {
        ClientError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("文件过大: {} 字节需要 {} 个分片", len, count),
        ))
    })
}

/// 发送修改 worker 上限的控制指令
///
/// 给出 `ack_timeout` 时等待服务端确认，返回生效后的上限。
pub fn send_capacity_directive(
    transport: &dyn Transport,
    sender: ClientId,
    limit: u64,
    ack_timeout: Option<Duration>,
) -> Result<Option<u64>, ClientError> {
    if limit == 0 || i64::try_from(limit).is_err() {
        return Err(ClientError::InvalidLimit(limit));
    }
    if !is_addressable(sender) {
        return Err(ClientError::InvalidClientId(sender));
    }

    transport.send(&Envelope::control(sender, limit))?;
    info!("已发送新的 worker 上限: {}", limit);

    let Some(timeout) = ack_timeout else {
        return Ok(None);
    };
    match transport.recv_reply(sender, Wait::Timeout(timeout))? {
        None => Err(ClientError::Timeout(sender)),
        Some(reply) if reply.status == ReplyStatus::ControlAck => Ok(Some(reply.payload_size)),
        Some(reply) if reply.status.is_rejection() => Err(ClientError::Rejected(reply.status)),
        Some(reply) => Err(ClientError::UnexpectedReply(reply.status)),
    }
}
