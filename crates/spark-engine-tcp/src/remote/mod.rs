//! # 远程访问客户端
//!
//! ## 核心意图（Why）
//! - 客户端进程持有一棵本地资产树，但映射、订阅与主题发布者的数据都在远端服务器上；
//! - 视图规则把这些能力解析为远程代理，调用方仍然通过 `acquire_map` 等入口使用同一套 trait。
//!
//! ## 契约（What）
//! - [`RemoteAccessExt::for_remote_access`] 在根资产上注册远程规则，覆盖同能力的默认规则；
//! - 全部远程视图共享一条 [`RemoteConnection`]，每个 `(路径, 能力)` 占用一个通道；
//! - 连接监视器作为 `ConnectionMonitor` 视图挂在根资产上，并接收连接与断开通知。
//!
//! ## 设计权衡
//! - 代理方法同步阻塞，与本地视图的 trait 保持一致；代价是调用线程在请求期间被占用。

mod connection;
mod views;

use std::sync::Arc;

use spark_engine::{
    AssetTree, Capability, ClientConnectionMonitor, EngineError, SessionDetails, View, WireType,
};

pub use connection::{RemoteConnection, RemoteOptions};
pub use views::{RemoteKeyValueStore, RemoteObjectSubscription, RemoteTopicPublisher};

use crate::error::Result;

/// 为资产树装配远程访问。
pub trait RemoteAccessExt {
    /// 以默认选项连接 `endpoints`。
    fn for_remote_access(
        &self,
        endpoints: &[&str],
        wire_type: WireType,
        session: SessionDetails,
        monitor: Option<Arc<dyn ClientConnectionMonitor>>,
    ) -> Result<Arc<RemoteConnection>> {
        self.for_remote_access_with(endpoints, wire_type, session, monitor, RemoteOptions::default())
    }

    /// 连接 `endpoints`（按顺序故障转移），并让映射类视图解析为远程代理。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 树上必须已有 `EventLoop` 视图（`for_server` / `for_testing` 装配），否则返回配置错误；
    ///   - `wire_type` 覆盖 `session` 中的线格式；
    ///   - 返回时监督任务已启动，连接在后台建立；首个请求会等待连接可用；
    /// - **执行 (How)**：在根资产上注册 `KeyValueStore`、`ObjectSubscription`、`TopicPublisher`
    ///   三条叶子规则；订阅规则经同一资产的映射视图取得订阅，两者共享计数。
    fn for_remote_access_with(
        &self,
        endpoints: &[&str],
        wire_type: WireType,
        session: SessionDetails,
        monitor: Option<Arc<dyn ClientConnectionMonitor>>,
        options: RemoteOptions,
    ) -> Result<Arc<RemoteConnection>>;
}

impl RemoteAccessExt for AssetTree {
    fn for_remote_access_with(
        &self,
        endpoints: &[&str],
        wire_type: WireType,
        mut session: SessionDetails,
        monitor: Option<Arc<dyn ClientConnectionMonitor>>,
        options: RemoteOptions,
    ) -> Result<Arc<RemoteConnection>> {
        let event_loop = self.event_loop().ok_or_else(|| {
            EngineError::config("remote access needs an EventLoop view on the tree")
        })?;
        session.wire_type = wire_type;
        if let Some(monitor) = &monitor {
            self.root().add_view(View::ConnectionMonitor(monitor.clone()));
        }
        let connection = RemoteConnection::connect(&event_loop, endpoints, session, monitor, options)?;

        let root = self.root();
        let remote = connection.clone();
        root.add_leaf_rule(Capability::KeyValueStore, "remote key value store", move |_, asset| {
            Ok(View::KeyValueStore(Arc::new(RemoteKeyValueStore::new(
                remote.clone(),
                asset.full_name(),
            ))))
        });
        root.add_leaf_rule(
            Capability::ObjectSubscription,
            "remote map subscription",
            |_, asset| Ok(View::ObjectSubscription(asset.acquire_key_value_store()?.subscription())),
        );
        let remote = connection.clone();
        root.add_leaf_rule(Capability::TopicPublisher, "remote topic publisher", move |_, asset| {
            Ok(View::TopicPublisher(Arc::new(RemoteTopicPublisher::new(
                remote.clone(),
                asset.full_name(),
            ))))
        });
        Ok(connection)
    }
}
