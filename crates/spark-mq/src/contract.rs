//! 调用上下文：取消与截止。
//!
//! 建连、接受等可能无限期挂起的操作都接收一个 [`CallContext`]，
//! 调用方借此主动放弃等待，而不是被迫陷入与进程同寿的重试循环。

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};

/// 取消原语，统一表达跨任务的可中断性契约。
///
/// # 设计背景（Why）
/// - 重试拨号、阻塞接受以及扇入任务都需要能够被外部打断，否则 `close` 之后仍会残留后台任务；
/// - 相比纯轮询原子位，额外挂一个 [`Notify`]，等待方可以在取消瞬间被唤醒。
///
/// # 逻辑解析（How）
/// - 内部使用 [`AtomicBool`] 表达取消状态，并通过 [`Arc`] 支持多方共享；
/// - `cancel` 在首次成功设置取消位时返回 `true` 并唤醒全部等待者，后续重复调用返回 `false`；
/// - `cancelled` 先注册唤醒再检查标志位，避免错过“检查之后、等待之前”发生的取消。
///
/// # 契约说明（What）
/// - **前置条件**：构造时无需额外参数，默认处于“未取消”状态；
/// - **后置条件**：一旦 `cancel` 成功，`is_cancelled` 全局可见，所有 `cancelled().await` 立即完成。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 将当前令牌标记为取消。
    ///
    /// 返回值为 `true` 表示本次调用首次触发取消；返回 `false` 表示之前已被取消。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 等待取消发生。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// 派生共享同一状态的子令牌，用于跨模块传播取消语义。
    pub fn child(&self) -> Self {
        self.clone()
    }
}

/// 截止原语，描述操作的最迟完成时间。
///
/// 基于 Tokio 单调时钟，因此与 `tokio::time::pause` 等测试工具兼容。
/// `Deadline::none()` 表示调用方未施加硬超时限制。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    /// 创建未设置截止时间的实例。
    pub const fn none() -> Self {
        Self { instant: None }
    }

    /// 根据绝对时间点构造截止时间。
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以当前时刻加持续时间生成截止时间。
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// 返回内部时间点。
    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// 判断是否已经超时。
    pub fn is_expired(&self) -> bool {
        match self.instant {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// 距离截止时间的剩余时长；未设置截止时返回 `None`。
    pub fn remaining(&self) -> Option<Duration> {
        self.instant
            .map(|instant| instant.saturating_duration_since(Instant::now()))
    }
}

/// 一次调用携带的取消与截止约束。
///
/// 克隆开销为一次 `Arc` 计数递增，可以放心在任务之间传递。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContext {
    /// 创建上下文构建器。
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    /// 获取取消原语。
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// 查询截止时间。
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }
}

/// [`CallContext`] 构建器。
#[derive(Debug, Default)]
pub struct CallContextBuilder {
    cancellation: Cancellation,
    deadline: Deadline,
}

impl CallContextBuilder {
    /// 设置取消原语。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// 设置截止时间。
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// 便捷设置相对超时。
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Deadline::after(timeout))
    }

    pub fn build(self) -> CallContext {
        CallContext {
            cancellation: self.cancellation,
            deadline: self.deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_wakes_waiters_once() {
        let token = Cancellation::new();
        let waiter = {
            let token = token.child();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::task::yield_now().await;
        assert!(token.cancel(), "首次取消应返回 true");
        assert!(!token.cancel(), "重复取消应返回 false");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must be woken")
            .expect("waiter join");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_cancelled() {
        let token = Cancellation::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already-cancelled token must not block");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_with_clock() {
        let deadline = Deadline::after(Duration::from_millis(50));
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::from_millis(50)));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
        assert_eq!(Deadline::none().remaining(), None);
    }
}
