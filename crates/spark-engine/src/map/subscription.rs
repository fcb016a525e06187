//! # 映射订阅（ObjectSubscription）
//!
//! ## 核心意图（Why）
//! - 同一个键值映射上存在三种订阅视角：只关心键、关心完整条目事件、把键当作主题；
//! - 映射变更还需要转发给同名子资产上的值订阅，使 `/map/key` 的订阅者看到该键的变化。
//!
//! ## 契约（What）
//! - 引导阶段按映射当前内容回放：键订阅者收到每个键，条目订阅者收到每个条目的 `Inserted`，
//!   主题订阅者收到每个 `(键, 值)`；
//! - 删除事件不会投递给主题订阅者；子资产值订阅在删除时收到 `null`。

use std::sync::{Arc, Weak};

use tracing::trace;

use super::event::{MapEvent, TopicMessage};
use super::store::EntrySource;
use crate::pubsub::{EventFilter, Registration, Subscriber, SubscriberSet, Subscription};
use crate::query::Predicate;
use crate::tree::{Asset, RequestContext};
use crate::view::{Capability, View};
use crate::wire::Value;

/// 映射订阅契约，本地与远程实现共享。
pub trait ObjectSubscription: Subscription {
    fn register_key_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<String>>,
    ) -> Registration;

    /// `filter` 作用于事件的新值；删除事件没有新值，因此不会通过带过滤器的订阅。
    fn register_entry_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<MapEvent>>,
        filter: Option<Predicate>,
    ) -> Registration;

    fn register_topic_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<TopicMessage>>,
    ) -> Registration;

    fn unregister_key_subscriber(&self, subscriber: &Arc<dyn Subscriber<String>>) -> bool;

    fn unregister_entry_subscriber(&self, subscriber: &Arc<dyn Subscriber<MapEvent>>) -> bool;

    fn unregister_topic_subscriber(&self, subscriber: &Arc<dyn Subscriber<TopicMessage>>)
    -> bool;
}

/// 本地键值映射上的订阅实现。
pub struct MapKvSubscription {
    asset: Weak<Asset>,
    asset_name: String,
    source: Weak<dyn EntrySource>,
    keys: SubscriberSet<String>,
    entries: SubscriberSet<MapEvent>,
    topics: SubscriberSet<TopicMessage>,
}

impl MapKvSubscription {
    pub(crate) fn new(asset: &Arc<Asset>, source: Weak<dyn EntrySource>) -> Self {
        Self {
            asset: Arc::downgrade(asset),
            asset_name: asset.full_name().to_owned(),
            source,
            keys: SubscriberSet::new("keys"),
            entries: SubscriberSet::new("entries"),
            topics: SubscriberSet::new("topics"),
        }
    }

    pub fn asset_name(&self) -> &str {
        &self.asset_name
    }

    fn current_entries(&self) -> Vec<(String, Value)> {
        self.source
            .upgrade()
            .map(|source| source.snapshot())
            .unwrap_or_default()
    }

    /// 分发一次映射变更。
    pub(crate) fn notify_event(&self, event: MapEvent) {
        trace!(asset = %self.asset_name, key = event.key(), "map event");
        self.entries.notify(&event);
        self.keys.notify(&event.key().to_owned());
        if let Some(value) = event.value() {
            self.topics.notify(&TopicMessage {
                topic: event.key().to_owned(),
                message: value.clone(),
            });
        }
        self.forward_to_child(&event);
    }

    fn forward_to_child(&self, event: &MapEvent) {
        let Some(asset) = self.asset.upgrade() else {
            return;
        };
        let Some(child) = asset.get_child(event.key()) else {
            return;
        };
        if let Some(View::ValueSubscription(subscription)) =
            child.get_view(Capability::ValueSubscription)
        {
            let value = event.value().cloned().unwrap_or(Value::Null);
            subscription.notify(&value);
        }
    }
}

impl Subscription for MapKvSubscription {
    fn subscriber_count(&self) -> usize {
        self.keys.len() + self.entries.len() + self.topics.len()
    }

    fn key_subscriber_count(&self) -> usize {
        self.keys.len()
    }

    fn entry_subscriber_count(&self) -> usize {
        self.entries.len()
    }

    fn topic_subscriber_count(&self) -> usize {
        self.topics.len()
    }

    fn close(&self) {
        self.keys.close();
        self.entries.close();
        self.topics.close();
    }
}

impl ObjectSubscription for MapKvSubscription {
    fn register_key_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<String>>,
    ) -> Registration {
        let bootstrap = rc.bootstrap();
        self.keys.register(subscriber, None, || {
            if bootstrap {
                self.current_entries().into_iter().map(|(key, _)| key).collect()
            } else {
                Vec::new()
            }
        })
    }

    fn register_entry_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<MapEvent>>,
        filter: Option<Predicate>,
    ) -> Registration {
        let bootstrap = rc.bootstrap();
        let filter: Option<EventFilter<MapEvent>> = filter.map(|predicate| {
            Arc::new(move |event: &MapEvent| event.value().is_some_and(|v| predicate.test(v)))
                as EventFilter<MapEvent>
        });
        self.entries.register(subscriber, filter, || {
            if !bootstrap {
                return Vec::new();
            }
            self.current_entries()
                .into_iter()
                .map(|(key, value)| MapEvent::Inserted {
                    asset: self.asset_name.clone(),
                    key,
                    value,
                })
                .collect()
        })
    }

    fn register_topic_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<TopicMessage>>,
    ) -> Registration {
        let bootstrap = rc.bootstrap();
        self.topics.register(subscriber, None, || {
            if !bootstrap {
                return Vec::new();
            }
            self.current_entries()
                .into_iter()
                .map(|(topic, message)| TopicMessage { topic, message })
                .collect()
        })
    }

    fn unregister_key_subscriber(&self, subscriber: &Arc<dyn Subscriber<String>>) -> bool {
        self.keys.unregister(subscriber)
    }

    fn unregister_entry_subscriber(&self, subscriber: &Arc<dyn Subscriber<MapEvent>>) -> bool {
        self.entries.unregister(subscriber)
    }

    fn unregister_topic_subscriber(
        &self,
        subscriber: &Arc<dyn Subscriber<TopicMessage>>,
    ) -> bool {
        self.topics.unregister(subscriber)
    }
}

impl std::fmt::Debug for MapKvSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapKvSubscription")
            .field("asset", &self.asset_name)
            .field("keys", &self.keys)
            .field("entries", &self.entries)
            .field("topics", &self.topics)
            .finish()
    }
}
