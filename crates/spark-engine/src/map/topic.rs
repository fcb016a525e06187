use std::sync::Arc;

use super::event::TopicMessage;
use super::store::KeyValueStore;
use crate::error::Result;
use crate::pubsub::{Registration, Subscriber};
use crate::tree::RequestContext;
use crate::wire::Value;

/// 以映射键为主题的发布接口。
pub trait TopicPublisher: Send + Sync {
    fn publish(&self, topic: &str, message: Value) -> Result<()>;

    fn register_topic_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<TopicMessage>>,
    ) -> Registration;

    fn unregister_topic_subscriber(&self, subscriber: &Arc<dyn Subscriber<TopicMessage>>)
    -> bool;
}

/// 建立在任意 [`KeyValueStore`] 上的主题发布者：发布即写入同名键。
pub struct MapTopicPublisher {
    store: Arc<dyn KeyValueStore>,
}

impl MapTopicPublisher {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

impl TopicPublisher for MapTopicPublisher {
    fn publish(&self, topic: &str, message: Value) -> Result<()> {
        self.store.put(topic, message).map(|_| ())
    }

    fn register_topic_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<TopicMessage>>,
    ) -> Registration {
        self.store
            .subscription()
            .register_topic_subscriber(rc, subscriber)
    }

    fn unregister_topic_subscriber(
        &self,
        subscriber: &Arc<dyn Subscriber<TopicMessage>>,
    ) -> bool {
        self.store
            .subscription()
            .unregister_topic_subscriber(subscriber)
    }
}
