use crate::contract::CallContext;
use crate::error::{OperationKind, SocketError, cancelled_error, timeout_error};
use std::future::Future;

/// 在保留取消/超时语义的前提下执行 Future。
///
/// 进入前先检查截止与取消，随后以 `biased` 顺序竞争“取消 → 超时 → 业务结果”，
/// 保证取消信号总是优先于已经就绪的结果被观察到。
pub(crate) async fn run_with_context<F, T>(
    ctx: &CallContext,
    kind: OperationKind,
    future: F,
) -> Result<T, SocketError>
where
    F: Future<Output = Result<T, SocketError>>,
{
    if ctx.deadline().is_expired() {
        return Err(timeout_error(kind));
    }
    if ctx.cancellation().is_cancelled() {
        return Err(cancelled_error(kind));
    }

    let cancel = ctx.cancellation().cancelled();
    tokio::pin!(cancel);
    tokio::pin!(future);

    if let Some(deadline) = ctx.deadline().instant() {
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            _ = &mut cancel => Err(cancelled_error(kind)),
            _ = &mut sleep => Err(timeout_error(kind)),
            result = &mut future => result,
        }
    } else {
        tokio::select! {
            biased;
            _ = &mut cancel => Err(cancelled_error(kind)),
            result = &mut future => result,
        }
    }
}
