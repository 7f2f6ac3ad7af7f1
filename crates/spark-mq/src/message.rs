use bytes::Bytes;

use crate::error::{DeliveryError, SocketError};

/// 消息种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Data,
    /// 协议命令帧。会话层不解释命令内容，原样交给调用方决定如何处理。
    Command,
}

/// 跨越套接字边界的消息单元。
///
/// # 教案式说明
/// - **意图 (Why)**：入站流中既可能出现数据帧，也可能出现命令帧或携带接收失败的占位消息；
///   三者共用一个类型，调用方通过 [`Message::kind`] 与 [`Message::delivery_error`] 分支处理；
/// - **契约 (What)**：`payload` 可以为空（例如无体命令）；`delivery_error` 为 `Some` 时
///   `payload` 没有业务含义；
/// - **设计权衡 (Trade-offs)**：负载使用 [`Bytes`]，克隆只增加引用计数，扇入路径不会复制数据。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    kind: MessageKind,
    delivery_error: Option<DeliveryError>,
}

impl Message {
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            kind: MessageKind::Data,
            delivery_error: None,
        }
    }

    pub fn command(body: impl Into<Bytes>) -> Self {
        Self {
            payload: body.into(),
            kind: MessageKind::Command,
            delivery_error: None,
        }
    }

    /// 构造一条携带接收失败的消息。
    pub fn failed(error: DeliveryError) -> Self {
        Self {
            payload: Bytes::new(),
            kind: MessageKind::Data,
            delivery_error: Some(error),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_command(&self) -> bool {
        self.kind == MessageKind::Command
    }

    pub fn delivery_error(&self) -> Option<&DeliveryError> {
        self.delivery_error.as_ref()
    }

    /// 拆解为负载与接收错误。
    pub fn into_parts(self) -> (Bytes, Option<DeliveryError>) {
        (self.payload, self.delivery_error)
    }

    /// 取出负载；若消息携带接收失败则返回 [`SocketError::Delivery`]。
    pub fn into_payload(self) -> Result<Bytes, SocketError> {
        match self.delivery_error {
            Some(err) => Err(SocketError::Delivery(err)),
            None => Ok(self.payload),
        }
    }
}
