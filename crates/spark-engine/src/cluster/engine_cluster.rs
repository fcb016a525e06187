//! # 集群注册表
//!
//! ## 核心意图（Why）
//! - 每个集群名对应一份成员表与按远端标识登记的策略/回调，所有连接处理器只读共享；
//! - 注册表只由配置装配修改，连接处理器从不写入。
//!
//! ## 契约（What）
//! - [`Clusters`] 作为根资产上的视图存在，按名称查找 [`EngineCluster`]；
//! - 查找结果为 `Arc` 克隆，读取期间不持有分片锁；
//! - 未登记策略的远端视为接受。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use super::host::{HostDetails, HostId};
use super::policy::{ConnectionChangedNotifier, ConnectionStrategy, TerminationEventHandler};
use crate::wire::WireType;

/// 拒绝连接后等待终止消息发出的默认宽限期。
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// 默认心跳超时。
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// 集群级的时间参数。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClusterTiming {
    /// `None` 表示不开启心跳子通道。
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_timeout: Duration,
    pub termination_grace: Duration,
}

impl Default for ClusterTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: None,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }
}

/// 单个集群的成员与策略表。
///
/// # 教案式说明
/// - **意图 (Why)**：握手成功后，连接处理器按 `(集群名, 远端标识)` 查出策略、通知器与终止回调；
/// - **契约 (What)**：`install_*` 覆盖同一远端的旧登记；`find_*` 返回克隆的 `Arc`；
/// - **风险 (Trade-offs)**：登记在连接建立之后才生效，已建立的连接不会重新评估策略。
pub struct EngineCluster {
    name: String,
    wire_type: WireType,
    timing: ClusterTiming,
    hosts: DashMap<HostId, HostDetails>,
    strategies: DashMap<HostId, Arc<dyn ConnectionStrategy>>,
    notifiers: DashMap<HostId, Arc<dyn ConnectionChangedNotifier>>,
    termination_handlers: DashMap<HostId, Arc<dyn TerminationEventHandler>>,
}

impl EngineCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            wire_type: WireType::default(),
            timing: ClusterTiming::default(),
            hosts: DashMap::new(),
            strategies: DashMap::new(),
            notifiers: DashMap::new(),
            termination_handlers: DashMap::new(),
        }
    }

    pub fn with_wire_type(mut self, wire_type: WireType) -> Self {
        self.wire_type = wire_type;
        self
    }

    pub fn with_timing(mut self, timing: ClusterTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wire_type(&self) -> WireType {
        self.wire_type
    }

    pub fn timing(&self) -> ClusterTiming {
        self.timing
    }

    pub fn add_host(&self, details: HostDetails) -> Option<HostDetails> {
        self.hosts.insert(details.host_id, details)
    }

    pub fn host(&self, host_id: HostId) -> Option<HostDetails> {
        self.hosts.get(&host_id).map(|entry| entry.value().clone())
    }

    /// 按标识升序返回成员表。
    pub fn hosts(&self) -> Vec<HostDetails> {
        let mut hosts: Vec<_> = self
            .hosts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        hosts.sort_by_key(|details| details.host_id);
        hosts
    }

    pub fn install_connection_strategy(&self, remote: HostId, strategy: Arc<dyn ConnectionStrategy>) {
        debug!(cluster = %self.name, remote, "connection strategy installed");
        self.strategies.insert(remote, strategy);
    }

    pub fn find_connection_strategy(&self, remote: HostId) -> Option<Arc<dyn ConnectionStrategy>> {
        self.strategies.get(&remote).map(|entry| entry.value().clone())
    }

    pub fn install_connection_notifier(
        &self,
        remote: HostId,
        notifier: Arc<dyn ConnectionChangedNotifier>,
    ) {
        self.notifiers.insert(remote, notifier);
    }

    pub fn find_connection_notifier(
        &self,
        remote: HostId,
    ) -> Option<Arc<dyn ConnectionChangedNotifier>> {
        self.notifiers.get(&remote).map(|entry| entry.value().clone())
    }

    pub fn install_termination_handler(
        &self,
        remote: HostId,
        handler: Arc<dyn TerminationEventHandler>,
    ) {
        self.termination_handlers.insert(remote, handler);
    }

    pub fn find_termination_handler(
        &self,
        remote: HostId,
    ) -> Option<Arc<dyn TerminationEventHandler>> {
        self.termination_handlers
            .get(&remote)
            .map(|entry| entry.value().clone())
    }
}

impl fmt::Debug for EngineCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCluster")
            .field("name", &self.name)
            .field("wire_type", &self.wire_type)
            .field("timing", &self.timing)
            .field("hosts", &self.hosts.len())
            .field("strategies", &self.strategies.len())
            .finish()
    }
}

/// 集群名到 [`EngineCluster`] 的映射视图。
#[derive(Default)]
pub struct Clusters {
    clusters: DashMap<String, Arc<EngineCluster>>,
}

impl Clusters {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记集群；同名集群被替换，旧实例返回给调用方。
    pub fn insert(&self, cluster: EngineCluster) -> Option<Arc<EngineCluster>> {
        let name = cluster.name().to_owned();
        self.clusters.insert(name, Arc::new(cluster))
    }

    pub fn get(&self, name: &str) -> Option<Arc<EngineCluster>> {
        self.clusters.get(name).map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.clusters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

impl fmt::Debug for Clusters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clusters")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cluster::{AcceptAllStrategy, RejectAllStrategy};

    #[test]
    fn clusters_lookup_and_replacement() {
        let clusters = Clusters::new();
        assert!(clusters.get("blue").is_none());
        assert!(clusters.insert(EngineCluster::new("blue")).is_none());
        clusters.insert(EngineCluster::new("green").with_wire_type(WireType::Json));
        let replaced = clusters
            .insert(EngineCluster::new("blue"))
            .expect("同名集群应被替换");
        assert_eq!(replaced.name(), "blue");
        assert_eq!(clusters.names(), vec!["blue".to_owned(), "green".to_owned()]);
        assert_eq!(
            clusters.get("green").expect("已登记").wire_type(),
            WireType::Json
        );
    }

    #[test]
    fn per_remote_registrations_are_isolated() {
        let cluster = EngineCluster::new("blue").with_timing(ClusterTiming {
            heartbeat_interval: Some(Duration::from_millis(500)),
            ..ClusterTiming::default()
        });
        cluster.add_host(HostDetails::new(2, "127.0.0.1:7002"));
        cluster.add_host(HostDetails::new(1, "127.0.0.1:7001"));
        cluster.install_connection_strategy(2, Arc::new(RejectAllStrategy));
        cluster.install_connection_strategy(3, Arc::new(AcceptAllStrategy));

        let terminated = Arc::new(AtomicUsize::new(0));
        let counter = terminated.clone();
        cluster.install_termination_handler(
            2,
            Arc::new(move |remote: HostId| {
                counter.fetch_add(remote as usize, Ordering::SeqCst);
            }),
        );

        assert_eq!(
            cluster.hosts().iter().map(|h| h.host_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(cluster.find_connection_strategy(2).is_some());
        assert!(cluster.find_connection_strategy(4).is_none());
        assert!(cluster.find_termination_handler(3).is_none());
        cluster
            .find_termination_handler(2)
            .expect("已登记终止回调")
            .on_process_termination(2);
        assert_eq!(terminated.load(Ordering::SeqCst), 2);
        assert_eq!(cluster.timing().termination_grace, DEFAULT_TERMINATION_GRACE);
    }
}
