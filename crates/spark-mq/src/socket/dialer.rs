use tracing::{debug, warn};

use crate::{
    config::RetryPolicy,
    contract::CallContext,
    endpoint::Endpoint,
    error::{self, SocketError},
    transport::{self, TransportStream},
    util::run_with_context,
};

/// 带重试的拨号器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 服务端可能晚于客户端启动，拨号失败后按固定间隔重试，直到对端出现；
/// - 无限重试必须能够被打断，因此每次拨号和每次等待都与 [`CallContext`] 的取消/截止竞争。
///
/// ## 逻辑 (How)
/// - 单次拨号失败后，若未达到 `max_attempts`，睡眠 `interval` 再试；
/// - 达到上限时返回 [`SocketError::DialExhausted`]，携带最后一次的 IO 错误；
/// - 取消与截止分别映射为 `Cancelled`/`Timeout`，并以 `OperationKind` 标注停在拨号还是等待阶段。
///
/// ## 契约 (What)
/// - 只负责建立传输，握手不在这里，握手失败也不会触发重试；
/// - 相邻两次尝试的间隔不小于 `interval`。
pub(crate) struct RetryDialer<'a> {
    endpoint: &'a Endpoint,
    policy: RetryPolicy,
}

impl<'a> RetryDialer<'a> {
    pub(crate) fn new(endpoint: &'a Endpoint, policy: RetryPolicy) -> Self {
        Self { endpoint, policy }
    }

    pub(crate) async fn dial(&self, ctx: &CallContext) -> Result<TransportStream, SocketError> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let outcome = run_with_context(ctx, error::DIAL, async {
                transport::dial(self.endpoint)
                    .await
                    .map_err(|source| SocketError::Dial {
                        address: self.endpoint.address().to_owned(),
                        source,
                    })
            })
            .await;

            let source = match outcome {
                Ok(stream) => {
                    debug!(attempt, peer = %stream.peer_addr(), "dial succeeded");
                    return Ok(stream);
                }
                Err(SocketError::Dial { source, .. }) => source,
                Err(other) => return Err(other),
            };

            if let Some(limit) = self.policy.max_attempts()
                && attempt >= limit.get()
            {
                warn!(attempt, error = %source, endpoint = %self.endpoint, "dial attempts exhausted");
                return Err(SocketError::DialExhausted {
                    address: self.endpoint.address().to_owned(),
                    attempts: attempt,
                    source,
                });
            }

            debug!(
                attempt,
                error = %source,
                retry_in = ?self.policy.interval(),
                "dial failed, retrying"
            );
            let interval = self.policy.interval();
            run_with_context(ctx, error::RETRY_WAIT, async {
                tokio::time::sleep(interval).await;
                Ok(())
            })
            .await?;
        }
    }
}
