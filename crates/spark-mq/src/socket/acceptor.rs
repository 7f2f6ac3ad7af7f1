use tracing::debug;

use crate::{
    contract::CallContext,
    endpoint::Endpoint,
    error::{self, SocketError},
    transport::{TransportListener, TransportStream},
    util::run_with_context,
};

/// 打开监听器。失败立即返回，不重试。
pub(crate) async fn listen(endpoint: &Endpoint) -> Result<TransportListener, SocketError> {
    let listener = TransportListener::bind(endpoint)
        .await
        .map_err(|source| SocketError::Listen {
            address: endpoint.address().to_owned(),
            source,
        })?;
    debug!(local = %listener.local_addr(), "listener ready");
    Ok(listener)
}

/// 在监听器上接受恰好一条入站传输。
pub(crate) async fn accept_one(
    listener: &TransportListener,
    ctx: &CallContext,
) -> Result<TransportStream, SocketError> {
    let stream = run_with_context(ctx, error::ACCEPT, async {
        listener
            .accept()
            .await
            .map_err(|source| SocketError::Accept { source })
    })
    .await?;
    debug!(peer = %stream.peer_addr(), "inbound transport accepted");
    Ok(stream)
}
