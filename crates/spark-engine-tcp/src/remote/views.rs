//! 远程视图：把引擎视图 trait 的调用翻译成会话请求。

use std::sync::Arc;

use spark_engine::map::TopicMessage;
use spark_engine::query::Predicate;
use spark_engine::wire::Value;
use spark_engine::{
    Capability, Document, EngineError, KeyValueStore, MapEvent, ObjectSubscription, Registration,
    RequestContext, Result, Subscriber, Subscription, TopicPublisher,
};

use super::connection::{LocalSubscriber, RemoteConnection};
use crate::protocol::{self, BOOTSTRAP, FILTER, FILTER_TYPE, KEY, Op, TOPIC, VALUE};

fn decode<T: serde::de::DeserializeOwned>(op: Op, reply: Value) -> Result<T> {
    serde_json::from_value(reply).map_err(|err| EngineError::Decode {
        what: format!("reply to `{}`", op.as_str()),
        detail: err.to_string(),
    })
}

/// 远端资产上的键值映射。
pub struct RemoteKeyValueStore {
    connection: Arc<RemoteConnection>,
    path: String,
    cid: u64,
    subscription: Arc<RemoteObjectSubscription>,
}

impl RemoteKeyValueStore {
    pub fn new(connection: Arc<RemoteConnection>, path: &str) -> Self {
        let cid = connection.channel(path, Capability::KeyValueStore);
        let subscription = Arc::new(RemoteObjectSubscription::new(connection.clone(), path));
        Self {
            connection,
            path: path.to_owned(),
            cid,
            subscription,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn call(&self, op: Op, build: impl FnOnce(Document) -> Document) -> Result<Value> {
        Ok(self.connection.call(self.cid, op, build)?)
    }

    fn call_optional(&self, op: Op, key: &str, value: Option<Value>) -> Result<Option<Value>> {
        let reply = self.call(op, |request| {
            let request = request.with(KEY, key);
            match value {
                Some(value) => request.with(VALUE, value),
                None => request,
            }
        })?;
        Ok(protocol::read_optional(&reply))
    }
}

impl KeyValueStore for RemoteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.call_optional(Op::Get, key, None)
    }

    fn put(&self, key: &str, value: Value) -> Result<Option<Value>> {
        self.call_optional(Op::Put, key, Some(value))
    }

    fn put_if_absent(&self, key: &str, value: Value) -> Result<Option<Value>> {
        self.call_optional(Op::PutIfAbsent, key, Some(value))
    }

    fn remove(&self, key: &str) -> Result<Option<Value>> {
        self.call_optional(Op::Remove, key, None)
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        decode(Op::ContainsKey, self.call(Op::ContainsKey, |r| r.with(KEY, key))?)
    }

    fn len(&self) -> Result<usize> {
        decode(Op::Len, self.call(Op::Len, |r| r)?)
    }

    fn keys(&self) -> Result<Vec<String>> {
        decode(Op::Keys, self.call(Op::Keys, |r| r)?)
    }

    fn entries(&self) -> Result<Vec<(String, Value)>> {
        decode(Op::Entries, self.call(Op::Entries, |r| r)?)
    }

    fn clear(&self) -> Result<()> {
        self.call(Op::Clear, |r| r).map(|_| ())
    }

    fn subscription(&self) -> Arc<dyn ObjectSubscription> {
        self.subscription.clone()
    }

    fn kind(&self) -> &'static str {
        "remote"
    }
}

impl std::fmt::Debug for RemoteKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteKeyValueStore")
            .field("path", &self.path)
            .field("cid", &self.cid)
            .finish()
    }
}

/// 远端映射上的订阅。
///
/// - **契约 (What)**：注册阻塞到服务端回复注册结果；同一订阅者重复注册返回
///   [`Registration::AlreadyPresent`] 且不重放引导；`close` 结束本通道上的全部远程订阅；
/// - **风险 (Trade-offs)**：过滤谓词以 `(值类型, 表达式)` 发送，由服务端重新编译。
pub struct RemoteObjectSubscription {
    connection: Arc<RemoteConnection>,
    path: String,
    cid: u64,
}

impl RemoteObjectSubscription {
    pub fn new(connection: Arc<RemoteConnection>, path: &str) -> Self {
        let cid = connection.channel(path, Capability::ObjectSubscription);
        Self {
            connection,
            path: path.to_owned(),
            cid,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn register(
        &self,
        rc: &RequestContext,
        subscriber: LocalSubscriber,
        filter: Option<Predicate>,
    ) -> Registration {
        let bootstrap = rc.bootstrap();
        self.connection.subscribe(self.cid, subscriber, |request| {
            let request = request.with(BOOTSTRAP, bootstrap);
            match filter {
                Some(filter) => request
                    .with(FILTER, filter.expression())
                    .with(FILTER_TYPE, filter.value_type()),
                None => request,
            }
        })
    }
}

impl Subscription for RemoteObjectSubscription {
    fn subscriber_count(&self) -> usize {
        self.connection.subscription_count(self.cid, None)
    }

    fn key_subscriber_count(&self) -> usize {
        self.connection
            .subscription_count(self.cid, Some(Op::SubscribeKeys))
    }

    fn entry_subscriber_count(&self) -> usize {
        self.connection
            .subscription_count(self.cid, Some(Op::SubscribeEntries))
    }

    fn topic_subscriber_count(&self) -> usize {
        self.connection
            .subscription_count(self.cid, Some(Op::SubscribeTopics))
    }

    fn close(&self) {
        self.connection.end_channel(self.cid);
    }
}

impl ObjectSubscription for RemoteObjectSubscription {
    fn register_key_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<String>>,
    ) -> Registration {
        self.register(rc, LocalSubscriber::Keys(subscriber), None)
    }

    fn register_entry_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<MapEvent>>,
        filter: Option<Predicate>,
    ) -> Registration {
        self.register(rc, LocalSubscriber::Entries(subscriber), filter)
    }

    fn register_topic_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<TopicMessage>>,
    ) -> Registration {
        self.register(rc, LocalSubscriber::Topics(subscriber), None)
    }

    fn unregister_key_subscriber(&self, subscriber: &Arc<dyn Subscriber<String>>) -> bool {
        self.connection
            .unsubscribe(self.cid, &LocalSubscriber::Keys(subscriber.clone()))
    }

    fn unregister_entry_subscriber(&self, subscriber: &Arc<dyn Subscriber<MapEvent>>) -> bool {
        self.connection
            .unsubscribe(self.cid, &LocalSubscriber::Entries(subscriber.clone()))
    }

    fn unregister_topic_subscriber(
        &self,
        subscriber: &Arc<dyn Subscriber<TopicMessage>>,
    ) -> bool {
        self.connection
            .unsubscribe(self.cid, &LocalSubscriber::Topics(subscriber.clone()))
    }
}

impl std::fmt::Debug for RemoteObjectSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObjectSubscription")
            .field("path", &self.path)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// 远端映射上的主题发布者。
pub struct RemoteTopicPublisher {
    connection: Arc<RemoteConnection>,
    cid: u64,
    subscription: RemoteObjectSubscription,
}

impl RemoteTopicPublisher {
    pub fn new(connection: Arc<RemoteConnection>, path: &str) -> Self {
        let cid = connection.channel(path, Capability::TopicPublisher);
        let subscription = RemoteObjectSubscription::new(connection.clone(), path);
        Self {
            connection,
            cid,
            subscription,
        }
    }
}

impl TopicPublisher for RemoteTopicPublisher {
    fn publish(&self, topic: &str, message: Value) -> Result<()> {
        self.connection
            .call(self.cid, Op::Publish, |request| {
                request.with(TOPIC, topic).with(VALUE, message)
            })?;
        Ok(())
    }

    fn register_topic_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<TopicMessage>>,
    ) -> Registration {
        self.subscription.register_topic_subscriber(rc, subscriber)
    }

    fn unregister_topic_subscriber(
        &self,
        subscriber: &Arc<dyn Subscriber<TopicMessage>>,
    ) -> bool {
        self.subscription.unregister_topic_subscriber(subscriber)
    }
}
