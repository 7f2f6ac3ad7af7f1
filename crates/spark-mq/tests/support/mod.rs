#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use spark_mq::{
    HandshakeOutcome, HandshakeParams, Mechanism, Metadata, ProtocolSession, SessionFactory,
    SessionReader, SessionWriter, Socket, SocketError, SocketType, TransportAddr,
    TransportStream,
};

pub const LOOPBACK: &str = "tcp://127.0.0.1:0";

/// 监听回环端口，再让 `clients` 个客户端依次连上，返回服务端、各客户端与监听地址。
pub async fn connected_pair_set(clients: usize) -> (Socket, Vec<Socket>, TransportAddr) {
    let server = Socket::server(Mechanism::Null);
    let addr = server.listen(LOOPBACK).await.expect("listen on loopback");
    let endpoint = addr.to_endpoint();
    let mut connected = Vec::with_capacity(clients);
    for _ in 0..clients {
        let client = Socket::client(Mechanism::Null);
        let (dialed, accepted) = tokio::join!(client.connect(&endpoint), server.accept());
        dialed.expect("client connects");
        accepted.expect("server accepts");
        connected.push(client);
    }
    (server, connected, addr)
}

/// 给阻塞操作加一个兜底超时，避免测试失败时整个进程挂起。
pub async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("operation finished in time")
}

/// 握手总是失败的引擎替身，记录被调用的次数。
#[derive(Clone, Default)]
pub struct RejectingEngine {
    pub opened: Arc<AtomicUsize>,
}

impl RejectingEngine {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl SessionFactory for RejectingEngine {
    fn open(&self, _transport: TransportStream) -> Box<dyn ProtocolSession> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(RejectingSession)
    }
}

struct RejectingSession;

#[async_trait]
impl ProtocolSession for RejectingSession {
    async fn prepare(
        &mut self,
        _params: &HandshakeParams<'_>,
    ) -> Result<HandshakeOutcome, SocketError> {
        Err(SocketError::handshake("peer is not welcome"))
    }

    fn into_split(self: Box<Self>) -> (Box<dyn SessionReader>, Box<dyn SessionWriter>) {
        (Box::new(SilentReader), Box::new(SilentWriter))
    }
}

/// 握手立即成功、从不产出消息的引擎替身。
#[derive(Clone, Default)]
pub struct SilentEngine;

impl SessionFactory for SilentEngine {
    fn open(&self, _transport: TransportStream) -> Box<dyn ProtocolSession> {
        Box::new(SilentSession)
    }
}

struct SilentSession;

#[async_trait]
impl ProtocolSession for SilentSession {
    async fn prepare(
        &mut self,
        params: &HandshakeParams<'_>,
    ) -> Result<HandshakeOutcome, SocketError> {
        let peer_socket_type = match params.socket_type {
            SocketType::Client => SocketType::Server,
            SocketType::Server => SocketType::Client,
        };
        Ok(HandshakeOutcome {
            peer_socket_type,
            peer_metadata: Metadata::new(),
        })
    }

    fn into_split(self: Box<Self>) -> (Box<dyn SessionReader>, Box<dyn SessionWriter>) {
        (Box::new(SilentReader), Box::new(SilentWriter))
    }
}

struct SilentReader;

#[async_trait]
impl SessionReader for SilentReader {
    async fn read_message(&mut self) -> Result<Option<spark_mq::Message>, SocketError> {
        std::future::pending().await
    }
}

struct SilentWriter;

#[async_trait]
impl SessionWriter for SilentWriter {
    async fn send_frame(&mut self, _payload: &[u8]) -> Result<(), SocketError> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), SocketError> {
        Ok(())
    }
}
