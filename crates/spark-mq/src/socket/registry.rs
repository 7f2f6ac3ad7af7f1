use std::sync::Arc;

use crate::{config::SendPolicy, endpoint::TransportAddr, error::SocketError};

use super::connection::Connection;

/// 按注册顺序保存连接的有序表。
///
/// 所有读改写都在套接字的异步互斥锁内完成；表本身不做同步。
/// 关闭后条目仍然保留，只是逐个转入关闭状态，因此计数在关闭前后保持不变。
#[derive(Debug, Default)]
pub(crate) struct ConnectionRegistry {
    entries: Vec<Arc<Connection>>,
    cursor: usize,
}

impl ConnectionRegistry {
    /// 追加一条连接，返回其下标。
    pub(crate) fn register(&mut self, connection: Arc<Connection>) -> usize {
        self.entries.push(connection);
        self.entries.len() - 1
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// 按发送策略挑选目标连接。
    pub(crate) fn select(&mut self, policy: SendPolicy) -> Result<Arc<Connection>, SocketError> {
        if self.entries.is_empty() {
            return Err(SocketError::NoConnection);
        }
        let index = match policy {
            SendPolicy::FirstOnly => 0,
            SendPolicy::RoundRobin => {
                let index = self.cursor % self.entries.len();
                self.cursor = index + 1;
                index
            }
        };
        Ok(Arc::clone(&self.entries[index]))
    }

    pub(crate) fn get(&self, index: usize) -> Result<Arc<Connection>, SocketError> {
        if self.entries.is_empty() {
            return Err(SocketError::NoConnection);
        }
        self.entries
            .get(index)
            .cloned()
            .ok_or(SocketError::UnknownConnection {
                index,
                len: self.entries.len(),
            })
    }

    pub(crate) fn peers(&self) -> Vec<TransportAddr> {
        self.entries
            .iter()
            .map(|connection| connection.peer_addr().clone())
            .collect()
    }

    /// 当前全部条目的快照，用于在锁外逐个关闭。
    pub(crate) fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.entries.clone()
    }
}
