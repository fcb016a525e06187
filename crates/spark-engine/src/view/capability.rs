use std::fmt;
use std::sync::Arc;

use crate::cluster::{Clusters, HostIdentifier};
use crate::error::{EngineError, Result};
use crate::map::{KeyValueStore, ObjectSubscription, Publisher, Reference, TopicPublisher};
use crate::pubsub::{SimpleSubscription, Subscription};
use crate::session::ClientConnectionMonitor;
use crate::threads::EventLoop;
use crate::wire::Value;

/// 资产可挂载的能力类型，是视图注册表的键。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Capability {
    KeyValueStore,
    ObjectSubscription,
    Reference,
    ValueSubscription,
    Publisher,
    TopicPublisher,
    Clusters,
    HostIdentifier,
    EventLoop,
    ConnectionMonitor,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::KeyValueStore,
        Capability::ObjectSubscription,
        Capability::Reference,
        Capability::ValueSubscription,
        Capability::Publisher,
        Capability::TopicPublisher,
        Capability::Clusters,
        Capability::HostIdentifier,
        Capability::EventLoop,
        Capability::ConnectionMonitor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::KeyValueStore => "key_value_store",
            Capability::ObjectSubscription => "object_subscription",
            Capability::Reference => "reference",
            Capability::ValueSubscription => "value_subscription",
            Capability::Publisher => "publisher",
            Capability::TopicPublisher => "topic_publisher",
            Capability::Clusters => "clusters",
            Capability::HostIdentifier => "host_identifier",
            Capability::EventLoop => "event_loop",
            Capability::ConnectionMonitor => "connection_monitor",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Capability::ALL
            .into_iter()
            .find(|capability| capability.as_str() == name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 挂在资产上的视图实例。
///
/// # 教案式说明
/// - **意图 (Why)**：能力集合是封闭的，用枚举代替“按运行时类型查表”，取用时即可得到具体类型；
/// - **契约 (What)**：每个变体与 [`Capability`] 一一对应，`capability()` 返回其键；克隆只复制 `Arc`；
/// - **风险 (Trade-offs)**：新增能力需要同时修改枚举与 `Capability`，换来编译期穷尽检查。
#[derive(Clone)]
pub enum View {
    KeyValueStore(Arc<dyn KeyValueStore>),
    ObjectSubscription(Arc<dyn ObjectSubscription>),
    Reference(Arc<dyn Reference>),
    ValueSubscription(Arc<SimpleSubscription<Value>>),
    Publisher(Arc<Publisher>),
    TopicPublisher(Arc<dyn TopicPublisher>),
    Clusters(Arc<Clusters>),
    HostIdentifier(HostIdentifier),
    EventLoop(Arc<EventLoop>),
    ConnectionMonitor(Arc<dyn ClientConnectionMonitor>),
}

impl View {
    pub fn capability(&self) -> Capability {
        match self {
            View::KeyValueStore(_) => Capability::KeyValueStore,
            View::ObjectSubscription(_) => Capability::ObjectSubscription,
            View::Reference(_) => Capability::Reference,
            View::ValueSubscription(_) => Capability::ValueSubscription,
            View::Publisher(_) => Capability::Publisher,
            View::TopicPublisher(_) => Capability::TopicPublisher,
            View::Clusters(_) => Capability::Clusters,
            View::HostIdentifier(_) => Capability::HostIdentifier,
            View::EventLoop(_) => Capability::EventLoop,
            View::ConnectionMonitor(_) => Capability::ConnectionMonitor,
        }
    }

    /// 当前视图上挂着的订阅者数量，用于用量统计。
    pub fn subscriber_count(&self) -> usize {
        match self {
            View::ObjectSubscription(subscription) => subscription.subscriber_count(),
            View::ValueSubscription(subscription) => subscription.subscriber_count(),
            _ => 0,
        }
    }

    /// 关闭前的通知阶段：订阅类视图向订阅者投递结束信号。
    pub(crate) fn notify_closing(&self) {
        match self {
            View::ObjectSubscription(subscription) => subscription.close(),
            View::ValueSubscription(subscription) => subscription.close(),
            _ => {}
        }
    }

    /// 释放视图资源。事件循环视图由资产树单独关闭，这里不处理。
    pub(crate) fn close(&self) {
        match self {
            View::KeyValueStore(store) => store.close(),
            View::ObjectSubscription(subscription) => subscription.close(),
            View::ValueSubscription(subscription) => subscription.close(),
            _ => {}
        }
    }

    pub fn into_key_value_store(self, path: &str) -> Result<Arc<dyn KeyValueStore>> {
        match self {
            View::KeyValueStore(store) => Ok(store),
            _ => Err(mismatch(path, Capability::KeyValueStore)),
        }
    }

    pub fn into_object_subscription(self, path: &str) -> Result<Arc<dyn ObjectSubscription>> {
        match self {
            View::ObjectSubscription(subscription) => Ok(subscription),
            _ => Err(mismatch(path, Capability::ObjectSubscription)),
        }
    }

    pub fn into_reference(self, path: &str) -> Result<Arc<dyn Reference>> {
        match self {
            View::Reference(reference) => Ok(reference),
            _ => Err(mismatch(path, Capability::Reference)),
        }
    }

    pub fn into_value_subscription(self, path: &str) -> Result<Arc<SimpleSubscription<Value>>> {
        match self {
            View::ValueSubscription(subscription) => Ok(subscription),
            _ => Err(mismatch(path, Capability::ValueSubscription)),
        }
    }

    pub fn into_publisher(self, path: &str) -> Result<Arc<Publisher>> {
        match self {
            View::Publisher(publisher) => Ok(publisher),
            _ => Err(mismatch(path, Capability::Publisher)),
        }
    }

    pub fn into_topic_publisher(self, path: &str) -> Result<Arc<dyn TopicPublisher>> {
        match self {
            View::TopicPublisher(publisher) => Ok(publisher),
            _ => Err(mismatch(path, Capability::TopicPublisher)),
        }
    }

    pub fn into_clusters(self, path: &str) -> Result<Arc<Clusters>> {
        match self {
            View::Clusters(clusters) => Ok(clusters),
            _ => Err(mismatch(path, Capability::Clusters)),
        }
    }

    pub fn into_host_identifier(self, path: &str) -> Result<HostIdentifier> {
        match self {
            View::HostIdentifier(identifier) => Ok(identifier),
            _ => Err(mismatch(path, Capability::HostIdentifier)),
        }
    }

    pub fn into_event_loop(self, path: &str) -> Result<Arc<EventLoop>> {
        match self {
            View::EventLoop(event_loop) => Ok(event_loop),
            _ => Err(mismatch(path, Capability::EventLoop)),
        }
    }

    pub fn into_connection_monitor(self, path: &str) -> Result<Arc<dyn ClientConnectionMonitor>> {
        match self {
            View::ConnectionMonitor(monitor) => Ok(monitor),
            _ => Err(mismatch(path, Capability::ConnectionMonitor)),
        }
    }
}

fn mismatch(path: &str, expected: Capability) -> EngineError {
    EngineError::ViewTypeMismatch {
        path: path.to_owned(),
        expected,
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            View::HostIdentifier(identifier) => f
                .debug_tuple("View::HostIdentifier")
                .field(identifier)
                .finish(),
            other => write!(f, "View::{}", other.capability()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_names_round_trip() {
        for capability in Capability::ALL {
            assert_eq!(Capability::from_name(capability.as_str()), Some(capability));
        }
        assert_eq!(Capability::from_name("nope"), None);
    }

    #[test]
    fn typed_access_reports_mismatch() {
        let view = View::HostIdentifier(HostIdentifier::new(3));
        assert_eq!(view.capability(), Capability::HostIdentifier);
        let err = view
            .clone()
            .into_clusters("/")
            .expect_err("主机标识视图不是 Clusters");
        assert_eq!(
            err,
            EngineError::ViewTypeMismatch {
                path: "/".to_owned(),
                expected: Capability::Clusters
            }
        );
        assert_eq!(
            view.into_host_identifier("/").expect("类型匹配").host_id(),
            3
        );
    }
}
