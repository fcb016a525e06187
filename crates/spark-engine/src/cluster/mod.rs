//! # cluster 模块
//!
//! ## 定位（Why）
//! - 描述“有哪些集群、每个集群有哪些主机、对每个远端采用什么策略”；
//! - 连接处理器在握手完成后从这里解析集群并读取策略。
//!
//! ## 组成（What）
//! - [`HostId`] / [`HostIdentifier`] / [`HostDetails`]：主机标识与成员描述；
//! - [`Clusters`] / [`EngineCluster`] / [`ClusterTiming`]：集群注册表；
//! - [`ConnectionStrategy`] / [`ConnectionChangedNotifier`] / [`TerminationEventHandler`]：按远端登记的回调。

mod engine_cluster;
mod host;
mod policy;

pub use engine_cluster::{
    ClusterTiming, Clusters, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_TERMINATION_GRACE, EngineCluster,
};
pub use host::{HostDetails, HostId, HostIdentifier};
pub use policy::{
    AcceptAllStrategy, ConnectionChangedNotifier, ConnectionStrategy, FnStrategy,
    RejectAllStrategy, TerminationEventHandler,
};
