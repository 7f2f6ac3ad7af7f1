//! 每条连接一个的扇入任务。
//!
//! ## 意图 (Why)
//! - 多条连接的入站消息需要汇入同一条流，`recv` 只从这一处取；
//! - 入站流是容量有限的 `mpsc` 通道：通道满时任务挂起、停止读取传输层，由 TCP 流控把压力传回对端，
//!   不丢弃任何消息。
//!
//! ## 契约 (What)
//! - 同一连接内按到达顺序转发，跨连接不保证顺序；
//! - 对端在帧边界关闭、连接被关闭，或转发完一条携带 [`DeliveryError`] 的消息后，任务结束；
//! - 读取遇到致命错误时，先把错误包装为消息送达，再退出，调用方的 `recv` 能看到这条失败。

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{Instrument, debug, info_span, warn};

use crate::{
    contract::Cancellation,
    endpoint::TransportAddr,
    error::DeliveryError,
    message::Message,
    session::SessionReader,
};

pub(crate) fn spawn(
    connection: u64,
    peer: &TransportAddr,
    reader: Box<dyn SessionReader>,
    sink: mpsc::Sender<Message>,
    closed: Cancellation,
) -> JoinHandle<()> {
    let span = info_span!("spark_mq.fan_in", connection, peer = %peer);
    tokio::spawn(forward(reader, sink, closed).instrument(span))
}

async fn forward(
    mut reader: Box<dyn SessionReader>,
    sink: mpsc::Sender<Message>,
    closed: Cancellation,
) {
    let mut forwarded: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = reader.read_message() => next,
        };

        let (message, last) = match next {
            Ok(Some(message)) => (message, false),
            Ok(None) => {
                debug!(forwarded, "peer closed the connection");
                break;
            }
            Err(err) => {
                warn!(code = err.code(), error = %err, "read failed; surfacing to receiver");
                (Message::failed(DeliveryError::from(&err)), true)
            }
        };

        let delivered = tokio::select! {
            biased;
            _ = closed.cancelled() => false,
            sent = sink.send(message) => sent.is_ok(),
        };
        if !delivered {
            break;
        }
        forwarded += 1;
        if last {
            break;
        }
    }
    debug!(forwarded, "fan-in stopped");
}
