//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为套接字层对外暴露的全部失败路径提供集中定义，调用方可以按变体分支处理，而不是解析字符串；
//! - 每个变体绑定稳定错误码（`spark.mq.*`）与 [`ErrorCategory`]，方便日志检索与上层重试决策。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，保证与 `std::error::Error` 生态兼容；
//! - IO 失败统一经由 [`map_io_error`] 映射，并以 [`OperationKind`] 标注发生在哪个阶段；
//! - 逐条消息携带的接收失败使用可克隆的 [`DeliveryError`]，不会终止整个入站流。

use std::{borrow::Cow, io, time::Duration};

use thiserror::Error;

use crate::endpoint::TransportAddr;
use crate::socket::Role;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const DIAL: OperationKind = OperationKind {
    code: "spark.mq.transport.dial_failed",
    message: "dial",
};
pub const LISTEN: OperationKind = OperationKind {
    code: "spark.mq.transport.listen_failed",
    message: "listen",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "spark.mq.transport.accept_failed",
    message: "accept",
};
pub const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.mq.session.handshake_failed",
    message: "handshake",
};
pub const READ: OperationKind = OperationKind {
    code: "spark.mq.session.read_failed",
    message: "read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "spark.mq.session.write_failed",
    message: "write",
};
pub const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.mq.session.shutdown_failed",
    message: "shutdown",
};
pub const RETRY_WAIT: OperationKind = OperationKind {
    code: "spark.mq.transport.retry_wait",
    message: "dial retry wait",
};

/// 错误分类，驱动上层是否重试以及何时重试。
///
/// - `Retryable` 附带建议的等待时长；
/// - `Timeout`/`Cancelled` 来自 [`CallContext`](crate::contract::CallContext) 的截止与取消；
/// - 其余情况视为 `NonRetryable`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Retryable(Duration),
    NonRetryable,
    Timeout,
    Cancelled,
}

/// 套接字会话层的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“调用方误用”“传输失败”“握手失败”“注册表状态错误”四类问题拆成独立变体，
///   让调用方能够精确区分“从未监听”与“监听成功但握手失败”等场景；
/// - **契约 (What)**：
///   - `InvalidAction` 与 `NoConnection` 在触碰任何共享状态或网络之前同步返回；
///   - `Dial` 只在拨号重试被策略终止时才会出现在 `DialExhausted` 的 `source` 中，默认策略下不会直接暴露；
///   - `Delivery` 仅由 [`Message::into_payload`](crate::message::Message::into_payload) 等便捷方法产生；
/// - **设计权衡 (Trade-offs)**：IO 错误保留原始 `io::Error` 作为 `source`，因此枚举不实现 `Clone`；
///   需要跨任务复制的场景请使用 [`DeliveryError`]。
#[derive(Debug, Error)]
pub enum SocketError {
    /// 在错误角色的套接字上调用 `connect`/`bind`。
    #[error("action `{action}` is not valid on a {role:?} socket")]
    InvalidAction { action: &'static str, role: Role },

    /// 端点字符串不满足 `scheme://address` 格式。
    #[error("malformed endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint {
        endpoint: String,
        reason: &'static str,
    },

    /// 端点使用了当前平台不支持的传输方案。
    #[error("unsupported transport scheme `{0}`")]
    UnsupportedScheme(String),

    /// 单次拨号失败。
    #[error("dial {address} failed: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    /// 拨号重试达到上限仍未成功。
    #[error("dial {address} abandoned after {attempts} attempts: {source}")]
    DialExhausted {
        address: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// 协议引擎握手失败，连接不会被注册。握手期间的传输失败保留为 `source`。
    #[error("handshake failed: {reason}")]
    Handshake {
        reason: Cow<'static, str>,
        #[source]
        source: Option<io::Error>,
    },

    /// 打开监听器失败。
    #[error("listen on {address} failed: {source}")]
    Listen {
        address: String,
        #[source]
        source: io::Error,
    },

    /// 接受入站连接失败。
    #[error("accept failed: {source}")]
    Accept {
        #[source]
        source: io::Error,
    },

    /// 在没有监听器的套接字上调用 `accept`。
    #[error("socket is not listening")]
    NotListening,

    /// 注册表为空时调用 `send`。
    #[error("no connection registered on this socket")]
    NoConnection,

    /// `send_to` 指定的下标越界。
    #[error("connection #{index} is not registered ({len} connections)")]
    UnknownConnection { index: usize, len: usize },

    /// 套接字或连接已经关闭。
    #[error("socket closed")]
    Closed,

    /// 操作被 [`Cancellation`](crate::contract::Cancellation) 打断。
    #[error("{} cancelled", .operation.message)]
    Cancelled { operation: OperationKind },

    /// 操作超过 [`Deadline`](crate::contract::Deadline)。
    #[error("{} timed out", .operation.message)]
    Timeout { operation: OperationKind },

    /// 会话读写阶段的 IO 失败。
    #[error("{} failed: {source}", .operation.message)]
    Io {
        operation: OperationKind,
        #[source]
        source: io::Error,
    },

    /// 对端违反帧或命令格式。
    #[error("protocol violation: {0}")]
    Protocol(Cow<'static, str>),

    /// 消息级的接收失败，经由便捷接口转成调用错误。
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// 配置非法或无法解析。
    #[error("invalid configuration: {0}")]
    Config(Cow<'static, str>),
}

impl SocketError {
    /// 构造握手失败。
    pub fn handshake(reason: impl Into<Cow<'static, str>>) -> Self {
        SocketError::Handshake {
            reason: reason.into(),
            source: None,
        }
    }

    /// 构造协议违规错误。
    pub fn protocol(reason: impl Into<Cow<'static, str>>) -> Self {
        SocketError::Protocol(reason.into())
    }

    /// 返回稳定错误码，供日志与告警聚合使用。
    pub fn code(&self) -> &'static str {
        match self {
            SocketError::InvalidAction { .. } => "spark.mq.socket.invalid_action",
            SocketError::InvalidEndpoint { .. } => "spark.mq.endpoint.malformed",
            SocketError::UnsupportedScheme(_) => "spark.mq.endpoint.unsupported_scheme",
            SocketError::Dial { .. } => DIAL.code,
            SocketError::DialExhausted { .. } => "spark.mq.transport.dial_exhausted",
            SocketError::Handshake { .. } => HANDSHAKE.code,
            SocketError::Listen { .. } => LISTEN.code,
            SocketError::Accept { .. } => ACCEPT.code,
            SocketError::NotListening => "spark.mq.socket.not_listening",
            SocketError::NoConnection => "spark.mq.socket.no_connection",
            SocketError::UnknownConnection { .. } => "spark.mq.socket.unknown_connection",
            SocketError::Closed => "spark.mq.socket.closed",
            SocketError::Cancelled { .. } => CANCEL_CODE,
            SocketError::Timeout { .. } => TIMEOUT_CODE,
            SocketError::Io { operation, .. } => operation.code,
            SocketError::Protocol(_) => "spark.mq.session.protocol_violation",
            SocketError::Delivery(err) => err.code(),
            SocketError::Config(_) => "spark.mq.config.invalid",
        }
    }

    /// 返回错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            SocketError::Dial { source, .. }
            | SocketError::DialExhausted { source, .. }
            | SocketError::Listen { source, .. }
            | SocketError::Accept { source }
            | SocketError::Io { source, .. } => categorize_io_error(source),
            SocketError::Cancelled { .. } => ErrorCategory::Cancelled,
            SocketError::Timeout { .. } => ErrorCategory::Timeout,
            _ => ErrorCategory::NonRetryable,
        }
    }
}

/// 随消息一起传递的接收失败。
///
/// 与 [`SocketError`] 不同，它可以克隆，能够跨任务嵌入 [`Message`](crate::message::Message)；
/// 一条失败的消息不会阻断同一套接字上后续的接收。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DeliveryError {
    code: &'static str,
    message: Cow<'static, str>,
}

impl DeliveryError {
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&SocketError> for DeliveryError {
    fn from(err: &SocketError) -> Self {
        DeliveryError::new(err.code(), err.to_string())
    }
}

/// `bind` 的失败结果，携带“是否已经监听”的标记。
///
/// `local_addr` 为 `Some` 表示监听与接受已经成功、失败发生在握手或注册阶段；
/// 为 `None` 表示没有走到握手（角色错误、端点非法或监听/接受失败）。
#[derive(Debug, Error)]
#[error("{source}")]
pub struct BindError {
    pub local_addr: Option<TransportAddr>,
    #[source]
    pub source: SocketError,
}

impl BindError {
    pub(crate) fn before_handshake(source: SocketError) -> Self {
        Self {
            local_addr: None,
            source,
        }
    }

    pub(crate) fn after_accept(local_addr: TransportAddr, source: SocketError) -> Self {
        Self {
            local_addr: Some(local_addr),
            source,
        }
    }

    /// 丢弃地址标记，只保留底层错误。
    pub fn into_source(self) -> SocketError {
        self.source
    }
}

const CANCEL_CODE: &str = "spark.mq.cancelled";
const TIMEOUT_CODE: &str = "spark.mq.timeout";

/// 将 IO 错误映射为会话层错误，并附带发生阶段。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> SocketError {
    SocketError::Io {
        operation: kind,
        source: error,
    }
}

/// 构造取消错误。
pub(crate) fn cancelled_error(kind: OperationKind) -> SocketError {
    SocketError::Cancelled { operation: kind }
}

/// 把握手途中的传输与协议失败归入 [`SocketError::Handshake`]，底层 IO 错误留作 `source`。
pub(crate) fn handshake_error(error: SocketError) -> SocketError {
    match error {
        SocketError::Io { operation, source } => SocketError::Handshake {
            reason: format!("{} failed during handshake: {source}", operation.message).into(),
            source: Some(source),
        },
        SocketError::Protocol(reason) => SocketError::Handshake {
            reason,
            source: None,
        },
        other => other,
    }
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind) -> SocketError {
    SocketError::Timeout { operation: kind }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            ErrorCategory::Retryable(Duration::from_millis(5))
        }
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => ErrorCategory::Retryable(Duration::from_millis(50)),
        ErrorKind::PermissionDenied | ErrorKind::Unsupported => ErrorCategory::NonRetryable,
        _ => ErrorCategory::NonRetryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_categorized_like_the_transport() {
        let refused = SocketError::Dial {
            address: "127.0.0.1:1".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(
            refused.category(),
            ErrorCategory::Retryable(Duration::from_millis(50))
        );
        assert_eq!(refused.code(), "spark.mq.transport.dial_failed");

        let denied = map_io_error(WRITE, io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.category(), ErrorCategory::NonRetryable);
        assert_eq!(denied.code(), WRITE.code);
    }

    #[test]
    fn cancel_and_timeout_carry_operation() {
        let cancelled = cancelled_error(DIAL);
        assert_eq!(cancelled.category(), ErrorCategory::Cancelled);
        assert_eq!(cancelled.to_string(), "dial cancelled");

        let timed_out = timeout_error(ACCEPT);
        assert_eq!(timed_out.category(), ErrorCategory::Timeout);
        assert_eq!(timed_out.to_string(), "accept timed out");
    }

    #[test]
    fn delivery_error_keeps_source_code() {
        let err = SocketError::protocol("frame exceeds limit");
        let delivery = DeliveryError::from(&err);
        assert_eq!(delivery.code(), "spark.mq.session.protocol_violation");
        assert_eq!(delivery.message(), "protocol violation: frame exceeds limit");

        let surfaced = SocketError::from(delivery.clone());
        assert_eq!(surfaced.code(), delivery.code());
    }

    #[test]
    fn handshake_io_failures_keep_their_source() {
        use std::error::Error as _;

        let eof = map_io_error(READ, io::Error::from(io::ErrorKind::UnexpectedEof));
        let err = handshake_error(eof);
        assert_eq!(err.code(), HANDSHAKE.code);
        let source = err.source().expect("io source kept");
        let io = source.downcast_ref::<io::Error>().expect("io::Error");
        assert_eq!(io.kind(), io::ErrorKind::UnexpectedEof);

        let violation = handshake_error(SocketError::protocol("bad greeting"));
        assert!(matches!(violation, SocketError::Handshake { source: None, .. }));
        assert!(matches!(
            handshake_error(SocketError::Closed),
            SocketError::Closed
        ));
    }
}
