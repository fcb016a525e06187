//! 单值引用与发布者。

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::store::KeyValueStore;
use crate::error::Result;
use crate::pubsub::{Registration, SimpleSubscription, Subscriber};
use crate::tree::{Asset, RequestContext};
use crate::view::{Capability, View};
use crate::wire::Value;

/// 单个值的读写句柄。
pub trait Reference: Send + Sync {
    fn get(&self) -> Result<Option<Value>>;

    fn set(&self, value: Value) -> Result<()>;

    fn remove(&self) -> Result<()>;

    /// 引用所在资产的完整名称。
    fn path(&self) -> &str;
}

/// 父资产是映射时，子资产的引用落在父映射的同名键上。
///
/// 写入经由映射完成，映射订阅负责把变化转发给本资产的值订阅。
pub struct MapReference {
    path: String,
    key: String,
    store: Arc<dyn KeyValueStore>,
}

impl MapReference {
    pub fn new(path: &str, key: &str, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            path: path.to_owned(),
            key: key.to_owned(),
            store,
        }
    }
}

impl Reference for MapReference {
    fn get(&self) -> Result<Option<Value>> {
        self.store.get(&self.key)
    }

    fn set(&self, value: Value) -> Result<()> {
        self.store.put(&self.key, value).map(|_| ())
    }

    fn remove(&self) -> Result<()> {
        self.store.remove(&self.key).map(|_| ())
    }

    fn path(&self) -> &str {
        &self.path
    }
}

/// 独立持有值的引用；写入后通知本资产已存在的值订阅。
pub struct VanillaReference {
    path: String,
    asset: Weak<Asset>,
    value: RwLock<Option<Value>>,
}

impl VanillaReference {
    pub fn new(asset: &Arc<Asset>) -> Self {
        Self {
            path: asset.full_name().to_owned(),
            asset: Arc::downgrade(asset),
            value: RwLock::new(None),
        }
    }

    fn notify(&self, value: &Value) {
        let Some(asset) = self.asset.upgrade() else {
            return;
        };
        if let Some(View::ValueSubscription(subscription)) =
            asset.get_view(Capability::ValueSubscription)
        {
            subscription.notify(value);
        }
    }
}

impl Reference for VanillaReference {
    fn get(&self) -> Result<Option<Value>> {
        Ok(self.value.read().clone())
    }

    fn set(&self, value: Value) -> Result<()> {
        *self.value.write() = Some(value.clone());
        self.notify(&value);
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let previous = self.value.write().take();
        if previous.is_some() {
            self.notify(&Value::Null);
        }
        Ok(())
    }

    fn path(&self) -> &str {
        &self.path
    }
}

/// 发布者：引用 + 值订阅的组合视图。
pub struct Publisher {
    reference: Arc<dyn Reference>,
    subscription: Arc<SimpleSubscription<Value>>,
}

impl Publisher {
    pub fn new(reference: Arc<dyn Reference>, subscription: Arc<SimpleSubscription<Value>>) -> Self {
        Self {
            reference,
            subscription,
        }
    }

    pub fn publish(&self, value: Value) -> Result<()> {
        self.reference.set(value)
    }

    pub fn get(&self) -> Result<Option<Value>> {
        self.reference.get()
    }

    pub fn register_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<Value>>,
    ) -> Registration {
        self.subscription.register_subscriber(rc, subscriber)
    }

    pub fn unregister_subscriber(&self, subscriber: &Arc<dyn Subscriber<Value>>) -> bool {
        self.subscription.unregister_subscriber(subscriber)
    }

    pub fn path(&self) -> &str {
        self.reference.path()
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("path", &self.path())
            .field("subscription", &self.subscription)
            .finish()
    }
}
