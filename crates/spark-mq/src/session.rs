//! # session 模块说明
//!
//! ## 角色定位（Why）
//! - 套接字层不关心线格式，它只依赖协议引擎完成三件事：握手、逐条解码入站消息、成帧发送；
//! - 本模块以 trait 描述这份最小契约，使内置的 [`ZmtpSessionFactory`](crate::zmtp::ZmtpSessionFactory)
//!   与测试替身、或未来的其他引擎可以互换。
//!
//! ## 契约（What）
//! - [`SessionFactory::open`]：为每条新建立的传输创建一个会话；
//! - [`ProtocolSession::prepare`]：每条连接恰好调用一次，且发生在任何收发之前；
//! - [`ProtocolSession::into_split`]：握手成功后拆为读半部与写半部，读半部交给扇入任务驱动，
//!   写半部由连接持有并以互斥锁串行化；
//! - [`SessionReader::read_message`]：返回 `Ok(None)` 表示对端在帧边界处正常关闭。
//!
//! ## 注意事项（Trade-offs）
//! - 使用 `async-trait` 换取对象安全，代价是每次调用一次堆分配；相对网络 IO 可忽略。

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    config::PlainCredentials, error::SocketError, message::Message, transport::TransportStream,
};

/// 协议层套接字类型，握手时交给对端校验兼容性。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketType {
    Client,
    Server,
}

impl SocketType {
    /// 线上的标准名称。
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketType::Client => "CLIENT",
            SocketType::Server => "SERVER",
        }
    }

    pub fn from_wire(name: &[u8]) -> Option<Self> {
        match name {
            b"CLIENT" => Some(SocketType::Client),
            b"SERVER" => Some(SocketType::Server),
            _ => None,
        }
    }

    /// 能否与对端类型组成合法的连接。CLIENT 只与 SERVER 配对。
    pub fn is_compatible_with(&self, peer: SocketType) -> bool {
        matches!(
            (self, peer),
            (SocketType::Client, SocketType::Server) | (SocketType::Server, SocketType::Client)
        )
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 安全机制选择器，套接字层只做透传。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Mechanism {
    #[default]
    Null,
    Plain,
    Curve,
}

impl Mechanism {
    /// 线上的标准名称。
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::Null => "NULL",
            Mechanism::Plain => "PLAIN",
            Mechanism::Curve => "CURVE",
        }
    }

    pub fn from_wire(name: &[u8]) -> Option<Self> {
        match name {
            b"NULL" => Some(Mechanism::Null),
            b"PLAIN" => Some(Mechanism::Plain),
            b"CURVE" => Some(Mechanism::Curve),
            _ => None,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 握手阶段交换的元数据属性，按名称有序。
pub type Metadata = BTreeMap<String, Bytes>;

/// 一次握手所需的全部输入。
#[derive(Clone, Debug)]
pub struct HandshakeParams<'a> {
    pub mechanism: Mechanism,
    pub socket_type: SocketType,
    pub as_server: bool,
    pub metadata: &'a Metadata,
    /// PLAIN 机制下，客户端用于发送、服务端用于校验的凭据。
    pub credentials: Option<&'a PlainCredentials>,
}

/// 握手结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub peer_socket_type: SocketType,
    pub peer_metadata: Metadata,
}

/// 为新建立的传输创建协议会话。
pub trait SessionFactory: Send + Sync + 'static {
    fn open(&self, transport: TransportStream) -> Box<dyn ProtocolSession>;
}

/// 绑定到单条传输的握手/成帧会话。
#[async_trait]
pub trait ProtocolSession: Send {
    /// 执行线上握手。
    async fn prepare(
        &mut self,
        params: &HandshakeParams<'_>,
    ) -> Result<HandshakeOutcome, SocketError>;

    /// 拆分为读写半部。
    fn into_split(self: Box<Self>) -> (Box<dyn SessionReader>, Box<dyn SessionWriter>);
}

/// 会话读半部：逐条产出解码后的消息。
#[async_trait]
pub trait SessionReader: Send {
    async fn read_message(&mut self) -> Result<Option<Message>, SocketError>;
}

/// 会话写半部：成帧并写出一条负载。
#[async_trait]
pub trait SessionWriter: Send {
    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), SocketError>;

    /// 关闭写方向；重复调用不得报错。
    async fn shutdown(&mut self) -> Result<(), SocketError>;
}
