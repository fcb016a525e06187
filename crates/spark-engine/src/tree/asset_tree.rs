//! # 资产树（AssetTree）
//!
//! ## 定位（Why）
//! - 对外的入口对象：持有根节点，按路径获取资产与视图，负责整棵树的关闭顺序；
//! - `for_server` / `for_testing` 装配默认视图规则、集群注册表与事件循环。
//!
//! ## 关闭顺序（What）
//! 1. 自上而下通知订阅者结束；
//! 2. 关闭事件循环（即使前一步 panic 也会执行）；
//! 3. 关闭根节点，递归释放全部视图与子节点。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use super::asset::Asset;
use super::context::TreeContext;
use super::request::RequestContext;
use crate::cluster::{Clusters, HostId, HostIdentifier};
use crate::config::EventLoopConfig;
use crate::error::Result;
use crate::map::{
    KeyValueStore, MapEvent, ObjectSubscription, Publisher, Reference, TopicMessage,
    TopicPublisher,
};
use crate::pubsub::{Registration, SimpleSubscription, Subscriber};
use crate::query::Predicate;
use crate::threads::EventLoop;
use crate::view::{Capability, View, install_default_rules};
use crate::wire::Value;

/// 资产树用量统计。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AssetTreeStats {
    /// 含根在内的资产数量。
    pub assets: usize,
    /// 已实例化的视图数量。
    pub views: usize,
    /// 订阅类视图上的订阅者总数。
    pub subscribers: usize,
    /// 根深度为 0。
    pub max_depth: usize,
}

pub struct AssetTree {
    root: Arc<Asset>,
    closed: AtomicBool,
}

impl AssetTree {
    /// 空树：没有任何规则与视图。
    pub fn new() -> Self {
        Self {
            root: Asset::new_root(Arc::new(TreeContext::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// 挂载本机 [`HostIdentifier`] 视图的空树。
    pub fn with_host_id(host_id: HostId) -> Self {
        let tree = Self::new();
        tree.root
            .add_view(View::HostIdentifier(HostIdentifier::new(host_id)));
        tree
    }

    /// 服务端装配：默认规则、集群注册表与自建事件循环。
    pub fn for_server(self, config: &EventLoopConfig) -> Result<Self> {
        let event_loop = EventLoop::owned(&config.name, config.worker_threads)?;
        self.install_server_views(Arc::new(event_loop));
        Ok(self)
    }

    /// 测试装配：在 Tokio 运行时内复用当前运行时，否则自建单线程运行时。
    pub fn for_testing(self) -> Result<Self> {
        let event_loop = EventLoop::current_or_owned("test-event-loop", 1)?;
        self.install_server_views(Arc::new(event_loop));
        Ok(self)
    }

    fn install_server_views(&self, event_loop: Arc<EventLoop>) {
        install_default_rules(&self.root);
        if self.root.get_view(Capability::Clusters).is_none() {
            self.root.add_view(View::Clusters(Arc::new(Clusters::new())));
        }
        if self.root.get_view(Capability::EventLoop).is_none() {
            self.root.add_view(View::EventLoop(event_loop));
        }
    }

    pub fn root(&self) -> &Arc<Asset> {
        &self.root
    }

    pub fn context(&self) -> &Arc<TreeContext> {
        self.root.context()
    }

    pub fn host_id(&self) -> Option<HostId> {
        self.root.host_identifier().map(|identifier| identifier.host_id())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 获取或创建资产；前导 `/` 可省略，空路径返回根。
    pub fn acquire_asset(&self, path: &str) -> Result<Arc<Asset>> {
        self.root.acquire_asset(path)
    }

    pub fn get_asset(&self, path: &str) -> Option<Arc<Asset>> {
        self.root.get_asset(path)
    }

    pub fn acquire_map(&self, path: &str) -> Result<Arc<dyn KeyValueStore>> {
        self.acquire_asset(path)?.acquire_key_value_store()
    }

    pub fn acquire_subscription(&self, path: &str) -> Result<Arc<dyn ObjectSubscription>> {
        self.acquire_asset(path)?.acquire_object_subscription()
    }

    pub fn acquire_reference(&self, path: &str) -> Result<Arc<dyn Reference>> {
        self.acquire_asset(path)?.acquire_reference()
    }

    pub fn acquire_value_subscription(&self, path: &str) -> Result<Arc<SimpleSubscription<Value>>> {
        self.acquire_asset(path)?.acquire_value_subscription()
    }

    pub fn acquire_publisher(&self, path: &str) -> Result<Arc<Publisher>> {
        self.acquire_asset(path)?.acquire_publisher()
    }

    pub fn acquire_topic_publisher(&self, path: &str) -> Result<Arc<dyn TopicPublisher>> {
        self.acquire_asset(path)?.acquire_topic_publisher()
    }

    pub fn clusters(&self) -> Result<Arc<Clusters>> {
        self.root.acquire_clusters()
    }

    pub fn event_loop(&self) -> Option<Arc<EventLoop>> {
        match self.root.get_view(Capability::EventLoop)? {
            View::EventLoop(event_loop) => Some(event_loop),
            _ => None,
        }
    }

    /// 在 `uri` 指向的映射上注册键订阅者。
    pub fn register_key_subscriber(
        &self,
        uri: &str,
        subscriber: Arc<dyn Subscriber<String>>,
    ) -> Result<Registration> {
        let rc = RequestContext::parse(uri);
        let subscription = self.acquire_subscription(rc.full_name())?;
        Ok(subscription.register_key_subscriber(&rc, subscriber))
    }

    /// 在 `uri` 指向的映射上注册条目订阅者，可附带过滤谓词。
    pub fn register_entry_subscriber(
        &self,
        uri: &str,
        subscriber: Arc<dyn Subscriber<MapEvent>>,
        filter: Option<Predicate>,
    ) -> Result<Registration> {
        let rc = RequestContext::parse(uri);
        let subscription = self.acquire_subscription(rc.full_name())?;
        Ok(subscription.register_entry_subscriber(&rc, subscriber, filter))
    }

    pub fn register_topic_subscriber(
        &self,
        uri: &str,
        subscriber: Arc<dyn Subscriber<TopicMessage>>,
    ) -> Result<Registration> {
        let rc = RequestContext::parse(uri);
        let subscription = self.acquire_subscription(rc.full_name())?;
        Ok(subscription.register_topic_subscriber(&rc, subscriber))
    }

    /// 在 `uri` 指向的值资产上注册值订阅者。
    pub fn register_value_subscriber(
        &self,
        uri: &str,
        subscriber: Arc<dyn Subscriber<Value>>,
    ) -> Result<Registration> {
        let rc = RequestContext::parse(uri);
        let subscription = self.acquire_value_subscription(rc.full_name())?;
        Ok(subscription.register_subscriber(&rc, subscriber))
    }

    /// 经树级缓存编译过滤表达式。
    pub fn compile_filter(&self, value_type: &str, expression: &str) -> Result<Predicate> {
        self.context().filters().compile(value_type, expression)
    }

    /// 统计整棵树的资产、视图与订阅者数量。
    pub fn usage_stats(&self) -> AssetTreeStats {
        let mut stats = AssetTreeStats::default();
        collect_stats(&self.root, 0, &mut stats);
        stats
    }

    /// 关闭整棵树；幂等。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(tree = %self, "asset tree closing");
        let guard = EventLoopGuard(self.event_loop());
        self.root.notify_closing();
        drop(guard);
        self.root.close();
    }
}

struct EventLoopGuard(Option<Arc<EventLoop>>);

impl Drop for EventLoopGuard {
    fn drop(&mut self) {
        if let Some(event_loop) = self.0.take() {
            if std::thread::panicking() {
                warn!("closing event loop while unwinding");
            }
            event_loop.close();
        }
    }
}

fn collect_stats(asset: &Arc<Asset>, depth: usize, stats: &mut AssetTreeStats) {
    stats.assets += 1;
    stats.max_depth = stats.max_depth.max(depth);
    for view in asset.views_snapshot() {
        stats.views += 1;
        stats.subscribers += view.subscriber_count();
    }
    for child in asset.children() {
        collect_stats(&child, depth + 1, stats);
    }
}

impl Default for AssetTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AssetTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree-{}", self.host_id().unwrap_or(0))
    }
}

impl fmt::Debug for AssetTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetTree")
            .field("name", &self.to_string())
            .field("root", &self.root)
            .field("closed", &self.is_closed())
            .finish()
    }
}
