//! # socket 模块说明
//!
//! ## 角色定位（Why）
//! - [`Socket`] 是面向调用方的唯一入口：客户端拨号、服务端监听与接受，握手成功的连接登记到注册表，
//!   每条连接的入站消息经扇入任务汇入同一条入站流；
//! - 角色在构造时固定，错误角色的调用在触碰网络之前即被拒绝。
//!
//! ## 架构关系（How）
//! - `dialer`：带重试、可取消的拨号；
//! - `acceptor`：打开监听器、每次接受一条传输；
//! - `registry`：按注册顺序保存连接并按 [`SendPolicy`](crate::SendPolicy) 选择发送目标；
//! - `connection`：单条连接的写任务、关闭信号与扇入任务句柄；
//! - `fan_in`：读半部到入站流的转发任务。
//!
//! ## 并发契约（What）
//! - `Socket` 可克隆，克隆共享同一份状态，可以在任意任务中并发调用；
//! - 注册表的所有读改写都持有异步互斥锁；
//! - `close` 之后，`recv` 先取完已缓冲的消息再返回 [`SocketError::Closed`]，进行中的拨号与接受同样以
//!   `Closed` 结束；
//! - 没有析构驱动的清理，释放传输必须显式调用 `close`。

mod acceptor;
mod connection;
mod dialer;
mod fan_in;
mod registry;

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{RetryPolicy, SocketConfig},
    contract::{CallContext, Cancellation},
    endpoint::{Endpoint, TransportAddr},
    error::{self, BindError, SocketError, timeout_error},
    message::Message,
    session::{HandshakeParams, Mechanism, SessionFactory, SocketType},
    transport::{TransportListener, TransportStream},
    util::run_with_context,
    zmtp::ZmtpSessionFactory,
};

use connection::Connection;
use dialer::RetryDialer;
use registry::ConnectionRegistry;

/// 套接字在会话建立中扮演的角色，构造后不可变。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// 只能 `connect`。
    Client,
    /// 只能 `bind`/`listen`/`accept`。
    Server,
}

impl Role {
    fn from_as_server(as_server: bool) -> Self {
        if as_server { Role::Server } else { Role::Client }
    }
}

/// 消息队列套接字。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“建立连接、握手、登记、汇聚入站、选择出站”封装在一个可克隆的句柄后面，
///   调用方只面对 `connect`/`bind`/`send`/`recv`/`close`；
/// - 协议细节由 [`SessionFactory`] 注入，默认使用内置的 ZMTP 引擎。
///
/// ## 逻辑 (How)
/// - 出站：按 [`SendPolicy`](crate::SendPolicy) 选中连接，交给该连接的写任务整帧写出；
/// - 入站：每条连接一个扇入任务，全部写入同一个容量有限的 `mpsc` 通道，`recv` 从接收端取；
/// - 关闭：先触发套接字级取消信号并收回入站发送端，再逐条关闭连接。
///
/// ## 契约 (What)
/// - 连接计数只会因成功的 `connect`/`bind`/`accept` 增加，每次恰好加一；
/// - `send` 在注册表为空时立即返回 [`SocketError::NoConnection`]，不会阻塞；
/// - `close` 可重复调用，也可以在任意任务中调用。
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    role: Role,
    socket_type: SocketType,
    mechanism: Mechanism,
    config: SocketConfig,
    engine: Arc<dyn SessionFactory>,
    retry: RwLock<RetryPolicy>,
    registry: AsyncMutex<ConnectionRegistry>,
    listener: Mutex<Option<Arc<TransportListener>>>,
    inbound_tx: Mutex<Option<mpsc::Sender<Message>>>,
    inbound_rx: AsyncMutex<mpsc::Receiver<Message>>,
    closed: Cancellation,
    next_id: AtomicU64,
}

impl Socket {
    /// 使用默认配置与内置 ZMTP 引擎创建套接字。`as_server` 决定角色。
    pub fn new(socket_type: SocketType, as_server: bool, mechanism: Mechanism) -> Self {
        let config = SocketConfig::default();
        let engine = Arc::new(ZmtpSessionFactory::new(config.max_frame_size));
        let retry = RetryPolicy::default();
        Self::from_parts(socket_type, as_server, mechanism, config, engine, retry)
    }

    /// CLIENT 类型的客户端套接字。
    pub fn client(mechanism: Mechanism) -> Self {
        Self::new(SocketType::Client, false, mechanism)
    }

    /// SERVER 类型的服务端套接字。
    pub fn server(mechanism: Mechanism) -> Self {
        Self::new(SocketType::Server, true, mechanism)
    }

    pub fn builder(socket_type: SocketType, as_server: bool) -> SocketBuilder {
        SocketBuilder {
            socket_type,
            as_server,
            mechanism: Mechanism::default(),
            config: SocketConfig::default(),
            engine: None,
        }
    }

    fn from_parts(
        socket_type: SocketType,
        as_server: bool,
        mechanism: Mechanism,
        config: SocketConfig,
        engine: Arc<dyn SessionFactory>,
        retry: RetryPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.inbound_capacity);
        Self {
            inner: Arc::new(SocketInner {
                role: Role::from_as_server(as_server),
                socket_type,
                mechanism,
                config,
                engine,
                retry: RwLock::new(retry),
                registry: AsyncMutex::new(ConnectionRegistry::default()),
                listener: Mutex::new(None),
                inbound_tx: Mutex::new(Some(tx)),
                inbound_rx: AsyncMutex::new(rx),
                closed: Cancellation::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn socket_type(&self) -> SocketType {
        self.inner.socket_type
    }

    pub fn mechanism(&self) -> Mechanism {
        self.inner.mechanism
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// 已登记的连接数，关闭后保持不变。
    pub async fn connection_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// 按注册顺序返回各连接的对端地址。
    pub async fn peers(&self) -> Vec<TransportAddr> {
        self.inner.registry.lock().await.peers()
    }

    /// 当前监听器的本地地址。
    pub fn listen_addr(&self) -> Option<TransportAddr> {
        self.inner
            .listener
            .lock()
            .as_ref()
            .map(|listener| listener.local_addr().clone())
    }

    /// 设置拨号重试间隔，零值被拒绝。上限次数保持不变。
    pub fn set_retry(&self, interval: Duration) -> Result<(), SocketError> {
        let mut retry = self.inner.retry.write();
        *retry = RetryPolicy::new(interval)?.with_max_attempts(retry.max_attempts());
        Ok(())
    }

    /// 当前拨号重试间隔。
    pub fn retry(&self) -> Duration {
        self.inner.retry.read().interval()
    }

    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        *self.inner.retry.write() = policy;
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        *self.inner.retry.read()
    }

    /// 拨号并握手，成功后登记连接。失败时按重试策略等待，默认无限重试。
    pub async fn connect(&self, endpoint: &str) -> Result<(), SocketError> {
        self.connect_with(&CallContext::default(), endpoint).await
    }

    /// 与 [`Socket::connect`] 相同，但受 `ctx` 的取消与截止约束。
    #[instrument(
        name = "spark_mq.connect",
        skip(self, ctx),
        fields(socket_type = %self.inner.socket_type, mechanism = %self.inner.mechanism)
    )]
    pub async fn connect_with(&self, ctx: &CallContext, endpoint: &str) -> Result<(), SocketError> {
        self.ensure_role(Role::Client, "connect")?;
        self.ensure_open()?;
        let endpoint = Endpoint::parse(endpoint)?;
        let policy = self.retry_policy();

        self.until_closed(async {
            let transport = RetryDialer::new(&endpoint, policy).dial(ctx).await?;
            self.establish(ctx, transport).await.map(|_| ())
        })
        .await
    }

    /// 监听并接受恰好一个对端，握手成功后登记，返回监听地址。
    pub async fn bind(&self, endpoint: &str) -> Result<TransportAddr, BindError> {
        self.bind_with(&CallContext::default(), endpoint).await
    }

    /// 与 [`Socket::bind`] 相同，但接受与握手受 `ctx` 约束。
    ///
    /// 失败时 [`BindError::local_addr`] 标记是否已经接受了对端：握手或登记失败时为 `Some`。
    #[instrument(
        name = "spark_mq.bind",
        skip(self, ctx),
        fields(socket_type = %self.inner.socket_type, mechanism = %self.inner.mechanism)
    )]
    pub async fn bind_with(
        &self,
        ctx: &CallContext,
        endpoint: &str,
    ) -> Result<TransportAddr, BindError> {
        let local = self
            .listen(endpoint)
            .await
            .map_err(BindError::before_handshake)?;
        let transport = self
            .accept_transport(ctx)
            .await
            .map_err(BindError::before_handshake)?;
        self.until_closed(self.establish(ctx, transport))
            .await
            .map_err(|err| BindError::after_accept(local.clone(), err))?;
        Ok(local)
    }

    /// 只打开监听器并返回实际绑定的地址（端口 `0` 时为分配的端口），不接受连接。
    ///
    /// 再次调用会替换之前的监听器。
    #[instrument(name = "spark_mq.listen", skip(self))]
    pub async fn listen(&self, endpoint: &str) -> Result<TransportAddr, SocketError> {
        self.ensure_role(Role::Server, "bind")?;
        self.ensure_open()?;
        let endpoint = Endpoint::parse(endpoint)?;
        let listener = acceptor::listen(&endpoint).await?;
        let local = listener.local_addr().clone();

        let mut slot = self.inner.listener.lock();
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        if slot.replace(Arc::new(listener)).is_some() {
            debug!(local = %local, "previous listener replaced");
        }
        info!(local = %local, "listening");
        Ok(local)
    }

    /// 在已有监听器上接受一个对端并握手，返回对端地址。
    pub async fn accept(&self) -> Result<TransportAddr, SocketError> {
        self.accept_with(&CallContext::default()).await
    }

    #[instrument(name = "spark_mq.accept", skip(self, ctx))]
    pub async fn accept_with(&self, ctx: &CallContext) -> Result<TransportAddr, SocketError> {
        let transport = self.accept_transport(ctx).await?;
        self.until_closed(self.establish(ctx, transport)).await
    }

    async fn accept_transport(&self, ctx: &CallContext) -> Result<TransportStream, SocketError> {
        self.ensure_role(Role::Server, "accept")?;
        self.ensure_open()?;
        let listener = self
            .inner
            .listener
            .lock()
            .clone()
            .ok_or(SocketError::NotListening)?;
        self.until_closed(acceptor::accept_one(&listener, ctx)).await
    }

    /// 把一条负载发往发送策略选中的连接。
    ///
    /// 负载入队后即使调用方放弃等待（例如外层超时），该帧也会完整写出，不会在流上留下半帧。
    pub async fn send(&self, payload: &[u8]) -> Result<(), SocketError> {
        self.ensure_open()?;
        let target = self
            .inner
            .registry
            .lock()
            .await
            .select(self.inner.config.send_policy)?;
        target.send(payload).await
    }

    /// 把一条负载发往第 `index` 条（按注册顺序）连接。
    pub async fn send_to(&self, index: usize, payload: &[u8]) -> Result<(), SocketError> {
        self.ensure_open()?;
        let target = self.inner.registry.lock().await.get(index)?;
        target.send(payload).await
    }

    /// 等待下一条入站消息。
    ///
    /// 消息可能携带 [`DeliveryError`](crate::DeliveryError)，或是一条命令消息；两者都不会终止入站流。
    /// 套接字关闭后先返回已缓冲的消息，随后返回 [`SocketError::Closed`]。
    pub async fn recv(&self) -> Result<Message, SocketError> {
        let mut inbound = self.inner.inbound_rx.lock().await;
        tokio::select! {
            biased;
            next = inbound.recv() => next.ok_or(SocketError::Closed),
            _ = self.inner.closed.cancelled() => inbound.try_recv().map_err(|_| SocketError::Closed),
        }
    }

    /// 只取负载；携带接收错误的消息转为 [`SocketError::Delivery`]。
    pub async fn recv_payload(&self) -> Result<Bytes, SocketError> {
        self.recv().await?.into_payload()
    }

    /// 关闭全部连接与监听器并唤醒阻塞中的 `recv`。可重复调用。
    ///
    /// 返回第一条连接写方向关闭失败的错误；其余连接仍会被关闭。
    #[instrument(name = "spark_mq.close", skip(self))]
    pub async fn close(&self) -> Result<(), SocketError> {
        let first = self.inner.closed.cancel();
        self.inner.inbound_tx.lock().take();
        self.inner.listener.lock().take();

        let connections = self.inner.registry.lock().await.snapshot();
        let mut outcome = Ok(());
        for connection in connections {
            if let Err(err) = connection.close().await
                && outcome.is_ok()
            {
                outcome = Err(err);
            }
        }
        if first {
            info!("socket closed");
        }
        outcome
    }

    fn ensure_role(&self, expected: Role, action: &'static str) -> Result<(), SocketError> {
        if self.inner.role == expected {
            Ok(())
        } else {
            Err(SocketError::InvalidAction {
                action,
                role: self.inner.role,
            })
        }
    }

    fn ensure_open(&self) -> Result<(), SocketError> {
        if self.is_closed() {
            Err(SocketError::Closed)
        } else {
            Ok(())
        }
    }

    async fn until_closed<T>(
        &self,
        future: impl Future<Output = Result<T, SocketError>>,
    ) -> Result<T, SocketError> {
        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(SocketError::Closed),
            result = future => result,
        }
    }

    /// 握手并登记一条新传输，返回对端地址。
    async fn establish(
        &self,
        ctx: &CallContext,
        transport: TransportStream,
    ) -> Result<TransportAddr, SocketError> {
        let inner = &self.inner;
        let local = transport.local_addr().clone();
        let peer = transport.peer_addr().clone();

        let mut session = inner.engine.open(transport);
        let params = HandshakeParams {
            mechanism: inner.mechanism,
            socket_type: inner.socket_type,
            as_server: inner.role == Role::Server,
            metadata: &inner.config.metadata,
            credentials: inner.config.plain.as_ref(),
        };
        let handshake = run_with_context(ctx, error::HANDSHAKE, session.prepare(&params));
        let outcome = match inner.config.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| timeout_error(error::HANDSHAKE))
                .and_then(|result| result),
            None => handshake.await,
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(peer = %peer, code = err.code(), error = %err, "handshake failed");
                return Err(err);
            }
        };

        let (reader, writer) = session.into_split();
        let mut registry = inner.registry.lock().await;
        let Some(sink) = inner.inbound_tx.lock().clone() else {
            return Err(SocketError::Closed);
        };
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(id, peer.clone(), writer));
        connection.attach_fan_in(fan_in::spawn(
            connection.id(),
            connection.peer_addr(),
            reader,
            sink,
            connection.closed_signal(),
        ));
        let index = registry.register(connection);
        info!(
            connection = id,
            index,
            local = %local,
            peer = %peer,
            peer_socket_type = %outcome.peer_socket_type,
            "connection registered"
        );
        Ok(peer)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("role", &self.inner.role)
            .field("socket_type", &self.inner.socket_type)
            .field("mechanism", &self.inner.mechanism)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// [`Socket`] 构建器：注入配置、元数据与协议引擎。
pub struct SocketBuilder {
    socket_type: SocketType,
    as_server: bool,
    mechanism: Mechanism,
    config: SocketConfig,
    engine: Option<Arc<dyn SessionFactory>>,
}

impl SocketBuilder {
    pub fn mechanism(mut self, mechanism: Mechanism) -> Self {
        self.mechanism = mechanism;
        self
    }

    pub fn config(mut self, config: SocketConfig) -> Self {
        self.config = config;
        self
    }

    /// 追加一条握手元数据属性。
    pub fn metadata(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.config.metadata.insert(name.into(), value.into());
        self
    }

    /// 替换协议引擎，默认使用 [`ZmtpSessionFactory`]。
    pub fn engine(mut self, engine: Arc<dyn SessionFactory>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// 校验配置并创建套接字。
    pub fn build(self) -> Result<Socket, SocketError> {
        self.config.validate()?;
        let retry = self.config.retry_policy()?;
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(ZmtpSessionFactory::new(self.config.max_frame_size)));
        Ok(Socket::from_parts(
            self.socket_type,
            self.as_server,
            self.mechanism,
            self.config,
            engine,
            retry,
        ))
    }
}

impl fmt::Debug for SocketBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketBuilder")
            .field("socket_type", &self.socket_type)
            .field("as_server", &self.as_server)
            .field("mechanism", &self.mechanism)
            .field("config", &self.config)
            .field("custom_engine", &self.engine.is_some())
            .finish()
    }
}
