//! # 集群连接策略与回调
//!
//! ## 核心意图（Why）
//! - 是否接受某个对端、连接变化通知谁、对端进程终止时做什么，都是按远端标识配置的策略；
//! - 连接处理器只负责在正确的时刻调用这些回调，不关心具体决策。
//!
//! ## 契约（What）
//! - [`ConnectionStrategy::notify_connected`] 返回 `false` 表示拒绝，处理器随后发送终止消息并延迟关闭；
//! - [`ConnectionChangedNotifier`] 在连接建立时收到 `true`，断开时收到 `false`，每个连接各一次；
//! - 回调在网络驱动线程上执行，不得阻塞。

use std::fmt;

use super::host::HostId;
use crate::server::{ClusterConnectionHandler, NetworkContext};

/// 连接准入策略。
pub trait ConnectionStrategy: Send + Sync {
    fn notify_connected(
        &self,
        handler: &ClusterConnectionHandler,
        local: HostId,
        remote: HostId,
    ) -> bool;
}

/// 无条件接受。
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllStrategy;

impl ConnectionStrategy for AcceptAllStrategy {
    fn notify_connected(&self, _: &ClusterConnectionHandler, _: HostId, _: HostId) -> bool {
        true
    }
}

/// 无条件拒绝。
#[derive(Clone, Copy, Debug, Default)]
pub struct RejectAllStrategy;

impl ConnectionStrategy for RejectAllStrategy {
    fn notify_connected(&self, _: &ClusterConnectionHandler, _: HostId, _: HostId) -> bool {
        false
    }
}

/// 以闭包表达的策略，参数为 `(local, remote)`。
pub struct FnStrategy<F> {
    decide: F,
}

impl<F> FnStrategy<F>
where
    F: Fn(HostId, HostId) -> bool + Send + Sync,
{
    pub fn new(decide: F) -> Self {
        Self { decide }
    }
}

impl<F> ConnectionStrategy for FnStrategy<F>
where
    F: Fn(HostId, HostId) -> bool + Send + Sync,
{
    fn notify_connected(
        &self,
        _: &ClusterConnectionHandler,
        local: HostId,
        remote: HostId,
    ) -> bool {
        (self.decide)(local, remote)
    }
}

impl<F> fmt::Debug for FnStrategy<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnStrategy")
    }
}

/// 连接建立/断开通知。
pub trait ConnectionChangedNotifier: Send + Sync {
    fn on_connection_changed(&self, connected: bool, context: &NetworkContext);
}

impl<F> ConnectionChangedNotifier for F
where
    F: Fn(bool, &NetworkContext) + Send + Sync,
{
    fn on_connection_changed(&self, connected: bool, context: &NetworkContext) {
        self(connected, context)
    }
}

/// 对端宣告进程终止时的回调。
pub trait TerminationEventHandler: Send + Sync {
    fn on_process_termination(&self, remote: HostId);
}

impl<F> TerminationEventHandler for F
where
    F: Fn(HostId) + Send + Sync,
{
    fn on_process_termination(&self, remote: HostId) {
        self(remote)
    }
}
