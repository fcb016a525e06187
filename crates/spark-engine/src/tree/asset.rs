//! # 资产节点（Asset）
//!
//! ## 核心意图（Why）
//! - 资产树中的每个节点以名字寻址，持有一组按能力索引的视图，并可懒创建子节点；
//! - 视图按需生成：首次请求某能力时，沿祖先链查找规则并执行工厂，结果缓存在节点上。
//!
//! ## 并发约束（What）
//! - 子节点表使用 `DashMap`，并发的同名获取只会产生一个子节点；
//! - 视图缓存使用读写锁；创建过程由可重入互斥锁串行化，包装规则可以在同一线程内递归解析
//!   其依赖的能力，并发请求者最终拿到同一个实例；
//! - 父指针为 `Weak`，子节点不会让父节点常驻。
//!
//! ## 生命周期（How）
//! - `notify_closing` 自上而下通知订阅类视图投递结束信号；
//! - `close` 先关闭自身视图，再递归关闭子节点，最后从父节点摘除。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{ReentrantMutex, RwLock};
use tracing::{debug, trace};

use super::context::TreeContext;
use super::path;
use super::request::RequestContext;
use crate::cluster::{Clusters, HostIdentifier};
use crate::error::{EngineError, Result};
use crate::map::{KeyValueStore, ObjectSubscription, Publisher, Reference, TopicPublisher};
use crate::pubsub::SimpleSubscription;
use crate::threads::EventLoop;
use crate::view::{Capability, View, ViewRule};
use crate::wire::Value;

pub struct Asset {
    name: Arc<str>,
    full_name: String,
    parent: Weak<Asset>,
    context: Arc<TreeContext>,
    children: DashMap<Arc<str>, Arc<Asset>>,
    views: RwLock<HashMap<Capability, View>>,
    view_creation: ReentrantMutex<()>,
    rules: RwLock<HashMap<Capability, Vec<ViewRule>>>,
    closed: AtomicBool,
}

impl Asset {
    pub(crate) fn new_root(context: Arc<TreeContext>) -> Arc<Self> {
        Arc::new(Self {
            name: Arc::from(""),
            full_name: "/".to_owned(),
            parent: Weak::new(),
            context,
            children: DashMap::new(),
            views: RwLock::new(HashMap::new()),
            view_creation: ReentrantMutex::new(()),
            rules: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn new_child(parent: &Arc<Asset>, name: &str) -> Self {
        Self {
            name: Arc::from(name),
            full_name: path::join(&parent.full_name, name),
            parent: Arc::downgrade(parent),
            context: parent.context.clone(),
            children: DashMap::new(),
            views: RwLock::new(HashMap::new()),
            view_creation: ReentrantMutex::new(()),
            rules: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn parent(&self) -> Option<Arc<Asset>> {
        self.parent.upgrade()
    }

    pub fn is_root(&self) -> bool {
        self.parent.upgrade().is_none() && self.name.is_empty()
    }

    /// 沿父链找到根节点。
    pub fn root(self: &Arc<Self>) -> Arc<Asset> {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub fn context(&self) -> &Arc<TreeContext> {
        &self.context
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 获取或创建直接子节点。
    pub fn acquire_child(self: &Arc<Self>, name: &str) -> Result<Arc<Asset>> {
        if let Some(child) = self.get_child(name) {
            return Ok(child);
        }
        if self.is_closed() {
            return Err(EngineError::closed(self.full_name.clone()));
        }
        let child = self
            .children
            .entry(Arc::from(name))
            .or_insert_with(|| {
                trace!(parent = %self.full_name, child = name, "asset created");
                Arc::new(Asset::new_child(self, name))
            })
            .value()
            .clone();
        if self.is_closed() {
            child.close();
            return Err(EngineError::closed(self.full_name.clone()));
        }
        Ok(child)
    }

    pub fn get_child(&self, name: &str) -> Option<Arc<Asset>> {
        self.children.get(name).map(|entry| entry.value().clone())
    }

    /// 按相对路径获取或创建后代节点；空路径返回自身。
    pub fn acquire_asset(self: &Arc<Self>, relative: &str) -> Result<Arc<Asset>> {
        let mut current = self.clone();
        for segment in path::segments(relative) {
            current = current.acquire_child(segment)?;
        }
        Ok(current)
    }

    /// 按相对路径查找已存在的后代节点，不创建。
    pub fn get_asset(self: &Arc<Self>, relative: &str) -> Option<Arc<Asset>> {
        let mut current = self.clone();
        for segment in path::segments(relative) {
            current = current.get_child(segment)?;
        }
        Some(current)
    }

    pub fn children(&self) -> Vec<Arc<Asset>> {
        self.children
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// 摘除并关闭子节点。
    pub fn remove_child(&self, name: &str) -> Option<Arc<Asset>> {
        let (_, child) = self.children.remove(name)?;
        child.close();
        Some(child)
    }

    /// 显式挂载视图，返回被替换的旧视图。
    pub fn add_view(&self, view: View) -> Option<View> {
        debug!(asset = %self.full_name, capability = %view.capability(), "view added");
        self.views.write().insert(view.capability(), view)
    }

    /// 只读查询已实例化的视图，不触发创建。
    pub fn get_view(&self, capability: Capability) -> Option<View> {
        self.views.read().get(&capability).cloned()
    }

    pub fn view_count(&self) -> usize {
        self.views.read().len()
    }

    pub(crate) fn views_snapshot(&self) -> Vec<View> {
        self.views.read().values().cloned().collect()
    }

    /// 自身或最近祖先上已实例化的视图。
    pub fn find_view(&self, capability: Capability) -> Option<View> {
        if let Some(view) = self.get_view(capability) {
            return Some(view);
        }
        let mut ancestor = self.parent();
        while let Some(asset) = ancestor {
            if let Some(view) = asset.get_view(capability) {
                return Some(view);
            }
            ancestor = asset.parent();
        }
        None
    }

    /// 获取视图，不存在时按规则创建。
    ///
    /// - **执行 (How)**：读锁快速路径 → 持可重入锁二次检查 → 沿祖先链查找规则并执行 → 写入缓存；
    /// - **契约 (What)**：找不到规则返回 [`EngineError::ViewUnavailable`]，不会影响树的其他部分；
    ///   并发请求同一能力只会执行一次工厂；工厂执行期间资产被关闭时，新视图立即关闭并返回
    ///   [`EngineError::Closed`]。
    pub fn acquire_view(self: &Arc<Self>, capability: Capability) -> Result<View> {
        if let Some(view) = self.get_view(capability) {
            return Ok(view);
        }
        if self.is_closed() {
            return Err(EngineError::closed(self.full_name.clone()));
        }
        let _creating = self.view_creation.lock();
        if let Some(view) = self.get_view(capability) {
            return Ok(view);
        }
        let rule = self.find_rule(capability).ok_or_else(|| EngineError::ViewUnavailable {
            capability,
            path: self.full_name.clone(),
        })?;
        let rc = RequestContext::for_view(&self.full_name, capability);
        let view = rule.create(&rc, self)?;
        debug!(
            asset = %self.full_name,
            %capability,
            rule = rule.description(),
            "view created"
        );
        let mut views = self.views.write();
        if self.is_closed() {
            drop(views);
            view.close();
            return Err(EngineError::closed(self.full_name.clone()));
        }
        views.insert(capability, view.clone());
        Ok(view)
    }

    fn find_rule(&self, capability: Capability) -> Option<ViewRule> {
        if let Some(rule) = self.own_rule(capability) {
            return Some(rule);
        }
        let mut ancestor = self.parent();
        while let Some(asset) = ancestor {
            if let Some(rule) = asset.own_rule(capability) {
                return Some(rule);
            }
            ancestor = asset.parent();
        }
        None
    }

    fn own_rule(&self, capability: Capability) -> Option<ViewRule> {
        self.rules
            .read()
            .get(&capability)
            .and_then(|rules| rules.last().cloned())
    }

    pub fn add_rule(&self, rule: ViewRule) {
        trace!(asset = %self.full_name, ?rule, "view rule registered");
        self.rules
            .write()
            .entry(rule.capability())
            .or_default()
            .push(rule);
    }

    pub fn add_leaf_rule<F>(&self, capability: Capability, description: &str, factory: F)
    where
        F: Fn(&RequestContext, &Arc<Asset>) -> Result<View> + Send + Sync + 'static,
    {
        self.add_rule(ViewRule::leaf(capability, description, factory));
    }

    pub fn add_wrapping_rule<F>(
        &self,
        capability: Capability,
        description: &str,
        underlying: Capability,
        factory: F,
    ) where
        F: Fn(&RequestContext, &Arc<Asset>, View) -> Result<View> + Send + Sync + 'static,
    {
        self.add_rule(ViewRule::wrapping(capability, description, underlying, factory));
    }

    pub fn acquire_key_value_store(self: &Arc<Self>) -> Result<Arc<dyn KeyValueStore>> {
        self.acquire_view(Capability::KeyValueStore)?
            .into_key_value_store(&self.full_name)
    }

    pub fn acquire_object_subscription(self: &Arc<Self>) -> Result<Arc<dyn ObjectSubscription>> {
        self.acquire_view(Capability::ObjectSubscription)?
            .into_object_subscription(&self.full_name)
    }

    pub fn acquire_reference(self: &Arc<Self>) -> Result<Arc<dyn Reference>> {
        self.acquire_view(Capability::Reference)?
            .into_reference(&self.full_name)
    }

    pub fn acquire_value_subscription(self: &Arc<Self>) -> Result<Arc<SimpleSubscription<Value>>> {
        self.acquire_view(Capability::ValueSubscription)?
            .into_value_subscription(&self.full_name)
    }

    pub fn acquire_publisher(self: &Arc<Self>) -> Result<Arc<Publisher>> {
        self.acquire_view(Capability::Publisher)?
            .into_publisher(&self.full_name)
    }

    pub fn acquire_topic_publisher(self: &Arc<Self>) -> Result<Arc<dyn TopicPublisher>> {
        self.acquire_view(Capability::TopicPublisher)?
            .into_topic_publisher(&self.full_name)
    }

    pub fn acquire_clusters(self: &Arc<Self>) -> Result<Arc<Clusters>> {
        self.acquire_view(Capability::Clusters)?
            .into_clusters(&self.full_name)
    }

    pub fn acquire_event_loop(self: &Arc<Self>) -> Result<Arc<EventLoop>> {
        self.acquire_view(Capability::EventLoop)?
            .into_event_loop(&self.full_name)
    }

    /// 本机标识：只查已挂载的视图，不触发创建。
    pub fn host_identifier(&self) -> Option<HostIdentifier> {
        match self.find_view(Capability::HostIdentifier)? {
            View::HostIdentifier(identifier) => Some(identifier),
            _ => None,
        }
    }

    /// 关闭前通知：订阅者收到结束信号，视图本身仍可读取。
    pub(crate) fn notify_closing(&self) {
        for view in self.views_snapshot() {
            view.notify_closing();
        }
        for child in self.children() {
            child.notify_closing();
        }
    }

    /// 关闭视图、递归关闭子节点并从父节点摘除；幂等。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let views: Vec<View> = self.views.write().drain().map(|(_, view)| view).collect();
        for view in &views {
            view.close();
        }
        for child in self.children() {
            child.close();
        }
        self.children.clear();
        if let Some(parent) = self.parent.upgrade() {
            parent
                .children
                .remove_if(&*self.name, |_, candidate| std::ptr::eq(candidate.as_ref(), self));
        }
        trace!(asset = %self.full_name, "asset closed");
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asset")
            .field("full_name", &self.full_name)
            .field("children", &self.children.len())
            .field("views", &self.view_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
