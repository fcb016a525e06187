/// 集群连接的生命周期状态。
///
/// # 教案式说明
/// - **意图 (Why)**：握手的每一步都有前置条件，显式状态让重复初始化、乱序消息在入口处被拒绝；
/// - **契约 (What)**：跃迁受 [`ConnectionState::can_transition_to`] 约束；任何状态都可以进入 `Closed`；
/// - **风险 (Trade-offs)**：`#[non_exhaustive]` 保留扩展空间，外部匹配需要兜底分支。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ConnectionState {
    /// 处理器已创建，尚未处理握手。
    Created,
    /// 握手描述已读取。
    HandshakeRead,
    /// 本地标识与本机 HostIdentifier 一致。
    IdentityChecked,
    /// 握手中的集群已在注册表中找到。
    ClusterResolved,
    /// 准入策略已经给出结论。
    StrategyChecked,
    /// 连接可用。
    Established,
    /// 已发送终止消息，等待宽限期结束。
    Terminating,
    /// 终态。
    Closed,
}

impl ConnectionState {
    /// - **执行 (How)**：匹配 `(self, target)` 元组，列出状态图中的所有边。
    pub fn can_transition_to(self, target: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, target),
            (Created, HandshakeRead)
                | (HandshakeRead, IdentityChecked)
                | (IdentityChecked, ClusterResolved)
                | (ClusterResolved, StrategyChecked)
                | (StrategyChecked, Established)
                | (StrategyChecked, Terminating)
                | (Established, Terminating)
                | (_, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Created => "created",
            ConnectionState::HandshakeRead => "handshake_read",
            ConnectionState::IdentityChecked => "identity_checked",
            ConnectionState::ClusterResolved => "cluster_resolved",
            ConnectionState::StrategyChecked => "strategy_checked",
            ConnectionState::Established => "established",
            ConnectionState::Terminating => "terminating",
            ConnectionState::Closed => "closed",
        }
    }
}

/// `on_initialize` 的结论。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitOutcome {
    /// 策略接受，连接进入 `Established`。
    Established,
    /// 策略拒绝，终止消息已发出，宽限期后关闭。
    Rejected,
    /// 集群未登记，初始化中止，没有发送任何协议消息。
    Aborted,
}
