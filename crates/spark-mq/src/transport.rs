use std::io;

#[cfg(unix)]
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream as TokioTcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(unix)]
use tracing::debug;

use crate::endpoint::{Endpoint, Scheme, TransportAddr};

/// 读半部的类型擦除形式。
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// 写半部的类型擦除形式。
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 已建立的原始传输连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 协议会话只需要“可读可写的字节流”，不应关心它来自 TCP 还是 Unix 域套接字；
/// - 在交给会话之前先记录本地/对端地址，握手失败时 `bind` 仍能把本地地址带回给调用方。
///
/// ## 逻辑 (How)
/// - `dial`/`TransportListener::accept` 负责构造；
/// - `into_split` 把流拆成独立拥有的读写半部并做类型擦除，读半部交给扇入任务，写半部留在连接上。
///
/// ## 契约 (What)
/// - **后置条件**：拆分后的两个半部互不阻塞，可以在不同任务中并发使用；
/// - **注意**：TCP 连接默认开启 `TCP_NODELAY`，小帧不会被 Nagle 算法延迟。
#[derive(Debug)]
pub enum TransportStream {
    Tcp {
        stream: TokioTcpStream,
        local_addr: TransportAddr,
        peer_addr: TransportAddr,
    },
    #[cfg(unix)]
    Ipc {
        stream: UnixStream,
        local_addr: TransportAddr,
        peer_addr: TransportAddr,
    },
}

impl TransportStream {
    fn from_tcp(stream: TokioTcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let local_addr = TransportAddr::from(stream.local_addr()?);
        let peer_addr = TransportAddr::from(stream.peer_addr()?);
        Ok(TransportStream::Tcp {
            stream,
            local_addr,
            peer_addr,
        })
    }

    #[cfg(unix)]
    fn from_unix(stream: UnixStream) -> io::Result<Self> {
        let local_addr = TransportAddr::Ipc(stream.local_addr()?.as_pathname().map(PathBuf::from));
        let peer_addr = TransportAddr::Ipc(stream.peer_addr()?.as_pathname().map(PathBuf::from));
        Ok(TransportStream::Ipc {
            stream,
            local_addr,
            peer_addr,
        })
    }

    pub fn local_addr(&self) -> &TransportAddr {
        match self {
            TransportStream::Tcp { local_addr, .. } => local_addr,
            #[cfg(unix)]
            TransportStream::Ipc { local_addr, .. } => local_addr,
        }
    }

    pub fn peer_addr(&self) -> &TransportAddr {
        match self {
            TransportStream::Tcp { peer_addr, .. } => peer_addr,
            #[cfg(unix)]
            TransportStream::Ipc { peer_addr, .. } => peer_addr,
        }
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            TransportStream::Tcp { stream, .. } => {
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
            #[cfg(unix)]
            TransportStream::Ipc { stream, .. } => {
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
        }
    }
}

/// 执行一次传输层拨号，不含重试。
pub(crate) async fn dial(endpoint: &Endpoint) -> io::Result<TransportStream> {
    match endpoint.scheme() {
        Scheme::Tcp => TransportStream::from_tcp(TokioTcpStream::connect(endpoint.address()).await?),
        #[cfg(unix)]
        Scheme::Ipc => TransportStream::from_unix(UnixStream::connect(endpoint.address()).await?),
        #[cfg(not(unix))]
        Scheme::Ipc => Err(io::Error::from(io::ErrorKind::Unsupported)),
    }
}

/// 对 Tokio 监听器的语义封装。
///
/// - `bind`：根据端点方案打开 TCP 或 Unix 域监听；
/// - `accept`：接受一个入站连接并包装为 [`TransportStream`]；
/// - `local_addr`：返回实际绑定的地址（端口 `0` 时为内核分配的端口）。
///
/// Unix 域监听器在析构时删除其套接字文件，同一路径可以再次监听。
#[derive(Debug)]
pub(crate) enum TransportListener {
    Tcp {
        inner: TokioTcpListener,
        local_addr: TransportAddr,
    },
    #[cfg(unix)]
    Ipc {
        inner: UnixListener,
        local_addr: TransportAddr,
    },
}

impl TransportListener {
    pub(crate) async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint.scheme() {
            Scheme::Tcp => {
                let inner = TokioTcpListener::bind(endpoint.address()).await?;
                let local_addr = TransportAddr::from(inner.local_addr()?);
                Ok(TransportListener::Tcp { inner, local_addr })
            }
            #[cfg(unix)]
            Scheme::Ipc => {
                let inner = UnixListener::bind(endpoint.address())?;
                let local_addr =
                    TransportAddr::Ipc(Some(PathBuf::from(endpoint.address())));
                Ok(TransportListener::Ipc { inner, local_addr })
            }
            #[cfg(not(unix))]
            Scheme::Ipc => Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
    }

    pub(crate) fn local_addr(&self) -> &TransportAddr {
        match self {
            TransportListener::Tcp { local_addr, .. } => local_addr,
            #[cfg(unix)]
            TransportListener::Ipc { local_addr, .. } => local_addr,
        }
    }

    pub(crate) async fn accept(&self) -> io::Result<TransportStream> {
        match self {
            TransportListener::Tcp { inner, .. } => {
                let (stream, _) = inner.accept().await?;
                TransportStream::from_tcp(stream)
            }
            #[cfg(unix)]
            TransportListener::Ipc { inner, .. } => {
                let (stream, _) = inner.accept().await?;
                TransportStream::from_unix(stream)
            }
        }
    }
}

#[cfg(unix)]
impl Drop for TransportListener {
    fn drop(&mut self) {
        if let TransportListener::Ipc {
            local_addr: TransportAddr::Ipc(Some(path)),
            ..
        } = self
            && let Err(err) = std::fs::remove_file(path.as_path())
            && err.kind() != io::ErrorKind::NotFound
        {
            debug!(path = %path.display(), error = %err, "ipc socket file not removed");
        }
    }
}
