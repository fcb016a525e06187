//! # 引擎配置
//!
//! ## 核心意图（Why）
//! - 主机标识、事件循环规模与集群成员表都来自部署配置，配置是 [`EngineCluster`] 唯一的写入方；
//! - 以 TOML 描述，`serde` 反序列化，未知字段直接报错，拼写错误不会被静默忽略。
//!
//! ## 契约（What）
//! - [`EngineConfig::from_toml_str`] / [`EngineConfig::load`] 解析并校验；
//! - [`EngineConfig::install`] 把主机标识与集群表挂到资产树根上，重复安装时同名集群被替换；
//! - 校验失败统一返回 [`EngineError::Config`]。
//!
//! ```toml
//! host_id = 1
//!
//! [event_loop]
//! name = "engine-event-loop"
//! worker_threads = 2
//!
//! [[clusters]]
//! name = "blue"
//! wire_type = "binary"
//! heartbeat_interval_ms = 500
//!
//! [[clusters.hosts]]
//! host_id = 2
//! connect_uri = "127.0.0.1:7002"
//! strategy = "reject"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::cluster::{
    AcceptAllStrategy, ClusterTiming, Clusters, EngineCluster, HostDetails, HostId,
    HostIdentifier, RejectAllStrategy,
};
use crate::error::{EngineError, Result};
use crate::tree::AssetTree;
use crate::view::{Capability, View};
use crate::wire::WireType;

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub host_id: Option<HostId>,
    #[serde(default)]
    pub event_loop: EventLoopConfig,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventLoopConfig {
    #[serde(default = "default_event_loop_name")]
    pub name: String,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            name: default_event_loop_name(),
            worker_threads: default_worker_threads(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub wire_type: WireType,
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_termination_grace_ms")]
    pub termination_grace_ms: u64,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

impl ClusterConfig {
    pub fn timing(&self) -> ClusterTiming {
        ClusterTiming {
            heartbeat_interval: self.heartbeat_interval_ms.map(Duration::from_millis),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            termination_grace: Duration::from_millis(self.termination_grace_ms),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub host_id: HostId,
    pub connect_uri: String,
    #[serde(default)]
    pub strategy: Option<StrategyConfig>,
}

/// 配置中可选的内建准入策略。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyConfig {
    Accept,
    Reject,
}

fn default_event_loop_name() -> String {
    "engine-event-loop".to_owned()
}

fn default_worker_threads() -> usize {
    2
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_termination_grace_ms() -> u64 {
    2_000
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(source).map_err(|err| EngineError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|err| EngineError::config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// 语义校验：名称非空且唯一、成员标识不重复、心跳间隔为正。
    pub fn validate(&self) -> Result<()> {
        if self.event_loop.worker_threads == 0 {
            return Err(EngineError::config("event_loop.worker_threads must be positive"));
        }
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.trim().is_empty() {
                return Err(EngineError::config("cluster name must not be empty"));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(EngineError::config(format!(
                    "cluster `{}` is declared twice",
                    cluster.name
                )));
            }
            if cluster.heartbeat_interval_ms == Some(0) {
                return Err(EngineError::config(format!(
                    "cluster `{}`: heartbeat_interval_ms must be positive",
                    cluster.name
                )));
            }
            let mut hosts = HashSet::new();
            for host in &cluster.hosts {
                if !hosts.insert(host.host_id) {
                    return Err(EngineError::config(format!(
                        "cluster `{}`: host {} is declared twice",
                        cluster.name, host.host_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// 把配置安装到资产树根上。
    pub fn install(&self, tree: &AssetTree) -> Result<()> {
        self.validate()?;
        let root = tree.root();
        if let Some(host_id) = self.host_id {
            root.add_view(View::HostIdentifier(HostIdentifier::new(host_id)));
        }

        let clusters = match root.get_view(Capability::Clusters) {
            Some(View::Clusters(clusters)) => clusters,
            _ => {
                let clusters = Arc::new(Clusters::new());
                root.add_view(View::Clusters(clusters.clone()));
                clusters
            }
        };

        for config in &self.clusters {
            let cluster = EngineCluster::new(config.name.as_str())
                .with_wire_type(config.wire_type)
                .with_timing(config.timing());
            for host in &config.hosts {
                cluster.add_host(HostDetails::new(host.host_id, host.connect_uri.as_str()));
                match host.strategy {
                    Some(StrategyConfig::Accept) => {
                        cluster.install_connection_strategy(host.host_id, Arc::new(AcceptAllStrategy))
                    }
                    Some(StrategyConfig::Reject) => {
                        cluster.install_connection_strategy(host.host_id, Arc::new(RejectAllStrategy))
                    }
                    None => {}
                }
            }
            info!(cluster = %config.name, hosts = config.hosts.len(), "cluster installed");
            clusters.insert(cluster);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        host_id = 1

        [event_loop]
        worker_threads = 4

        [[clusters]]
        name = "blue"
        wire_type = "json"
        heartbeat_interval_ms = 500

        [[clusters.hosts]]
        host_id = 1
        connect_uri = "127.0.0.1:7001"

        [[clusters.hosts]]
        host_id = 2
        connect_uri = "127.0.0.1:7002"
        strategy = "reject"
    "#;

    #[test]
    fn parses_defaults_and_timing() {
        let config = EngineConfig::from_toml_str(SAMPLE).expect("示例配置合法");
        assert_eq!(config.host_id, Some(1));
        assert_eq!(config.event_loop.name, "engine-event-loop");
        assert_eq!(config.event_loop.worker_threads, 4);
        let blue = &config.clusters[0];
        assert_eq!(blue.wire_type, WireType::Json);
        let timing = blue.timing();
        assert_eq!(timing.heartbeat_interval, Some(Duration::from_millis(500)));
        assert_eq!(timing.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(timing.termination_grace, Duration::from_secs(2));
        assert_eq!(blue.hosts[1].strategy, Some(StrategyConfig::Reject));
    }

    #[test]
    fn rejects_unknown_fields_and_duplicates() {
        let typo = "host_idd = 1";
        assert_eq!(
            EngineConfig::from_toml_str(typo).expect_err("未知字段").code(),
            "engine.config"
        );

        let duplicate_host = r#"
            [[clusters]]
            name = "blue"
            [[clusters.hosts]]
            host_id = 2
            connect_uri = "a:1"
            [[clusters.hosts]]
            host_id = 2
            connect_uri = "b:1"
        "#;
        let err = EngineConfig::from_toml_str(duplicate_host).expect_err("重复主机");
        assert!(err.to_string().contains("host 2"));

        let empty_name = "[[clusters]]\nname = \" \"";
        assert!(EngineConfig::from_toml_str(empty_name).is_err());
    }

    #[test]
    fn install_populates_root_views() {
        let config = EngineConfig::from_toml_str(SAMPLE).expect("示例配置合法");
        let tree = AssetTree::new();
        config.install(&tree).expect("安装成功");
        assert_eq!(tree.host_id(), Some(1));
        let blue = tree
            .clusters()
            .expect("Clusters 视图已安装")
            .get("blue")
            .expect("blue 集群已登记");
        assert_eq!(blue.hosts().len(), 2);
        assert!(blue.find_connection_strategy(2).is_some());
        assert!(blue.find_connection_strategy(1).is_none());
    }
}
