use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{Instrument, debug, info_span, warn};

use crate::{
    contract::Cancellation,
    endpoint::TransportAddr,
    error::{self, SocketError, map_io_error},
    session::SessionWriter,
};

/// 写队列深度；队列满时 `send` 在入队处等待。
const WRITE_QUEUE_CAPACITY: usize = 64;

/// 交给写任务的一帧负载及其结果回执。
struct WriteRequest {
    payload: Bytes,
    done: oneshot::Sender<Result<(), SocketError>>,
}

/// 注册表中的一条已握手连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 连接由套接字的注册表独占持有，写半部交给专属写任务，读半部交给扇入任务；
/// - 关闭需要同时停止两侧：写任务收尾并关闭写方向，扇入任务通过 `closed` 信号退出。
///
/// ## 逻辑 (How)
/// - `send` 只把负载放入写队列并等待回执，真正的写出发生在写任务里；
///   调用方丢弃 `send` 的 future（例如外层超时）不会打断一帧写到一半，流上永远是完整的帧；
/// - 写任务按入队顺序逐帧写出，并与关闭信号竞争，卡在对端不读的写操作不会阻塞 `close`；
/// - `close` 通过 [`Cancellation::cancel`] 的返回值保证状态只切换一次，随后等待写任务关闭写方向、
///   再等待扇入任务结束。
///
/// ## 契约 (What)
/// - **前置条件**：构造需在 Tokio 运行时内；`attach_fan_in` 在注册前调用一次；
/// - **后置条件**：`close` 返回后，该连接不会再向入站流推送任何消息；
/// - **注意**：已入队的帧即使调用方不再等待也会完整写出；写失败后写任务退出，后续 `send` 返回
///   [`SocketError::Closed`]；并发的第二次 `close` 立即返回，不等待第一次完成。
pub(crate) struct Connection {
    id: u64,
    peer_addr: TransportAddr,
    requests: mpsc::Sender<WriteRequest>,
    closed: Cancellation,
    writer: Mutex<Option<JoinHandle<Result<(), SocketError>>>>,
    fan_in: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(id: u64, peer_addr: TransportAddr, writer: Box<dyn SessionWriter>) -> Self {
        let closed = Cancellation::new();
        let (requests, queue) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let span = info_span!("spark_mq.writer", connection = id, peer = %peer_addr);
        let task = tokio::spawn(drain_writes(writer, queue, closed.child()).instrument(span));
        Self {
            id,
            peer_addr,
            requests,
            closed,
            writer: Mutex::new(Some(task)),
            fan_in: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn peer_addr(&self) -> &TransportAddr {
        &self.peer_addr
    }

    /// 扇入任务监听的关闭信号。
    pub(crate) fn closed_signal(&self) -> Cancellation {
        self.closed.child()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn attach_fan_in(&self, handle: JoinHandle<()>) {
        *self.fan_in.lock() = Some(handle);
    }

    pub(crate) async fn send(&self, payload: &[u8]) -> Result<(), SocketError> {
        if self.closed.is_cancelled() {
            return Err(SocketError::Closed);
        }
        let (done, receipt) = oneshot::channel();
        let request = WriteRequest {
            payload: Bytes::copy_from_slice(payload),
            done,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(SocketError::Closed),
            result = async {
                self.requests
                    .send(request)
                    .await
                    .map_err(|_| SocketError::Closed)?;
                receipt.await.map_err(|_| SocketError::Closed)?
            } => result,
        }
    }

    pub(crate) async fn close(&self) -> Result<(), SocketError> {
        if !self.closed.cancel() {
            return Ok(());
        }

        let writer = self.writer.lock().take();
        let shutdown = match writer {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => Err(map_io_error(error::SHUTDOWN, std::io::Error::other(err))),
            },
            None => Ok(()),
        };
        if let Err(err) = &shutdown {
            warn!(connection = self.id, error = %err, "writer shutdown failed");
        }

        let handle = self.fan_in.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(connection = self.id, error = %err, "fan-in task ended abnormally");
        }
        debug!(connection = self.id, peer = %self.peer_addr, "connection closed");
        shutdown
    }
}

/// 写任务：按入队顺序整帧写出，关闭或写失败后关闭写方向并返回其结果。
async fn drain_writes(
    mut writer: Box<dyn SessionWriter>,
    mut queue: mpsc::Receiver<WriteRequest>,
    closed: Cancellation,
) -> Result<(), SocketError> {
    let mut written: u64 = 0;
    loop {
        let request = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = queue.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };
        let result = tokio::select! {
            biased;
            _ = closed.cancelled() => {
                let _ = request.done.send(Err(SocketError::Closed));
                break;
            }
            result = writer.send_frame(&request.payload) => result,
        };
        let failed = result.as_ref().err().map(|err| err.code());
        let _ = request.done.send(result);
        if let Some(code) = failed {
            warn!(code, written, "write failed; writer stops");
            break;
        }
        written += 1;
    }
    debug!(written, "writer stopped");
    writer.shutdown().await
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
