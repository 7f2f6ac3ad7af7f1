//! 端点字符串解析：`<scheme>://<address>`。

use std::{fmt, net::SocketAddr, path::PathBuf, str::FromStr};

use crate::error::SocketError;

const SEPARATOR: &str = "://";

/// 支持的传输方案。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// TCP，地址形如 `host:port`。
    Tcp,
    /// Unix 域套接字，地址为文件系统路径；仅在 unix 平台可用。
    Ipc,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ipc => "ipc",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 解析后的端点。
///
/// 只允许恰好一个 `://` 分隔符，且方案与地址都不能为空；
/// 地址本身不在此处解析，TCP 主机名交给拨号阶段解析。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    address: String,
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self, SocketError> {
        let malformed = |reason| SocketError::InvalidEndpoint {
            endpoint: endpoint.to_owned(),
            reason,
        };

        let (scheme, address) = endpoint
            .split_once(SEPARATOR)
            .ok_or_else(|| malformed("missing `://` separator"))?;
        if address.contains(SEPARATOR) {
            return Err(malformed("more than one `://` separator"));
        }
        if scheme.is_empty() {
            return Err(malformed("empty scheme"));
        }
        if address.is_empty() {
            return Err(malformed("empty address"));
        }

        let scheme = match scheme {
            "tcp" => Scheme::Tcp,
            "ipc" if cfg!(unix) => Scheme::Ipc,
            other => return Err(SocketError::UnsupportedScheme(other.to_owned())),
        };

        Ok(Self {
            scheme,
            address: address.to_owned(),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl FromStr for Endpoint {
    type Err = SocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.scheme, SEPARATOR, self.address)
    }
}

/// 已建立传输的实际地址。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    Tcp(SocketAddr),
    /// Unix 域套接字路径；匿名的客户端一侧为 `None`。
    Ipc(Option<PathBuf>),
}

impl TransportAddr {
    /// 以端点形式返回地址，便于直接交给 `connect`。
    pub fn to_endpoint(&self) -> String {
        self.to_string()
    }

    /// TCP 地址的便捷访问。
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            TransportAddr::Tcp(addr) => Some(*addr),
            TransportAddr::Ipc(_) => None,
        }
    }
}

impl From<SocketAddr> for TransportAddr {
    fn from(addr: SocketAddr) -> Self {
        TransportAddr::Tcp(addr)
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
            TransportAddr::Ipc(Some(path)) => write!(f, "ipc://{}", path.display()),
            TransportAddr::Ipc(None) => f.write_str("ipc://<unnamed>"),
        }
    }
}
