use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{self, SocketError, map_io_error};

const FLAG_MORE: u8 = 0x01;
const FLAG_LONG: u8 = 0x02;
const FLAG_COMMAND: u8 = 0x04;
const RESERVED_MASK: u8 = !(FLAG_MORE | FLAG_LONG | FLAG_COMMAND);
const SHORT_LIMIT: usize = u8::MAX as usize;

/// 线上的一帧。
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) command: bool,
    pub(crate) more: bool,
    pub(crate) body: Bytes,
}

/// 编码一帧：标志字节 + 1 或 8 字节大端长度 + 帧体。
pub(crate) fn encode(command: bool, more: bool, body: &[u8], dst: &mut BytesMut) {
    let mut flags = 0u8;
    if command {
        flags |= FLAG_COMMAND;
    }
    if more {
        flags |= FLAG_MORE;
    }
    if body.len() > SHORT_LIMIT {
        dst.reserve(1 + 8 + body.len());
        dst.put_u8(flags | FLAG_LONG);
        dst.put_u64(body.len() as u64);
    } else {
        dst.reserve(1 + 1 + body.len());
        dst.put_u8(flags);
        dst.put_u8(body.len() as u8);
    }
    dst.put_slice(body);
}

/// 读取一帧。
///
/// 在帧边界遇到 EOF 返回 `Ok(None)`；帧中途断开、保留位被置位或长度超过 `max_frame_size`
/// 都视为错误。
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    max_frame_size: u64,
) -> Result<Option<Frame>, SocketError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut flags = [0u8; 1];
    let read = reader
        .read(&mut flags)
        .await
        .map_err(|err| map_io_error(error::READ, err))?;
    if read == 0 {
        return Ok(None);
    }
    let flags = flags[0];
    if flags & RESERVED_MASK != 0 {
        return Err(SocketError::protocol(format!(
            "reserved frame flag bits set: {flags:#04x}"
        )));
    }

    let size = if flags & FLAG_LONG != 0 {
        reader.read_u64().await
    } else {
        reader.read_u8().await.map(u64::from)
    }
    .map_err(|err| map_io_error(error::READ, err))?;

    if size > max_frame_size {
        return Err(SocketError::protocol(format!(
            "frame of {size} bytes exceeds limit of {max_frame_size} bytes"
        )));
    }
    let size = usize::try_from(size)
        .map_err(|_| SocketError::protocol("frame size does not fit in memory"))?;

    let mut body = BytesMut::zeroed(size);
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| map_io_error(error::READ, err))?;

    Ok(Some(Frame {
        command: flags & FLAG_COMMAND != 0,
        more: flags & FLAG_MORE != 0,
        body: body.freeze(),
    }))
}
