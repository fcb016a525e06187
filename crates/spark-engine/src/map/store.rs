//! # 键值存储
//!
//! ## 契约（What）
//! - [`KeyValueStore`] 是映射能力的统一接口，本地实现基于 `DashMap`，远程实现把每个操作转成请求；
//! - 所有操作返回 `Result`，本地实现只在关闭后返回错误；
//! - 每次成功修改都会向映射订阅发出恰好一个事件：新键为 `Inserted`，覆盖为 `Updated`，删除为 `Removed`。

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::event::MapEvent;
use super::subscription::{MapKvSubscription, ObjectSubscription};
use crate::error::{EngineError, Result};
use crate::pubsub::Subscription;
use crate::tree::Asset;
use crate::wire::Value;

/// 键值映射能力。
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// 写入并返回旧值。
    fn put(&self, key: &str, value: Value) -> Result<Option<Value>>;

    /// 键不存在时写入；返回已存在的值（写入成功时为 `None`）。
    fn put_if_absent(&self, key: &str, value: Value) -> Result<Option<Value>>;

    fn remove(&self, key: &str) -> Result<Option<Value>>;

    fn contains_key(&self, key: &str) -> Result<bool>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn keys(&self) -> Result<Vec<String>>;

    fn entries(&self) -> Result<Vec<(String, Value)>>;

    /// 逐个删除全部键，每个键产生一个删除事件。
    fn clear(&self) -> Result<()>;

    fn subscription(&self) -> Arc<dyn ObjectSubscription>;

    /// 实现种类，便于诊断（`vanilla`、`remote` 等）。
    fn kind(&self) -> &'static str;

    fn close(&self) {}
}

/// 为映射订阅提供引导快照。
pub(crate) trait EntrySource: Send + Sync {
    fn snapshot(&self) -> Vec<(String, Value)>;
}

/// 本地内存键值存储。
///
/// # 教案式说明
/// - **意图 (Why)**：`DashMap` 分片锁让不同键的写入并行，事件在释放分片锁之后再分发，
///   订阅者回调里可以安全地回读同一个映射；
/// - **契约 (What)**：`put_if_absent` 与 `remove` 通过 `entry` API 保证检查与修改原子完成；
/// - **风险 (Trade-offs)**：不同线程对同一键的并发写入，事件顺序与最终值的写入顺序可能不一致。
pub struct VanillaKeyValueStore {
    asset_name: String,
    map: DashMap<String, Value>,
    subscription: Arc<MapKvSubscription>,
    closed: AtomicBool,
}

impl VanillaKeyValueStore {
    pub fn new(asset: &Arc<Asset>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let source: Weak<dyn EntrySource> = weak.clone();
            Self {
                asset_name: asset.full_name().to_owned(),
                map: DashMap::new(),
                subscription: Arc::new(MapKvSubscription::new(asset, source)),
                closed: AtomicBool::new(false),
            }
        })
    }

    pub fn map_subscription(&self) -> &Arc<MapKvSubscription> {
        &self.subscription
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::closed(self.asset_name.clone()))
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: MapEvent) {
        self.subscription.notify_event(event);
    }
}

impl EntrySource for VanillaKeyValueStore {
    fn snapshot(&self) -> Vec<(String, Value)> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl KeyValueStore for VanillaKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        Ok(self.map.get(key).map(|entry| entry.value().clone()))
    }

    fn put(&self, key: &str, value: Value) -> Result<Option<Value>> {
        self.ensure_open()?;
        let previous = self.map.insert(key.to_owned(), value.clone());
        let event = match &previous {
            None => MapEvent::Inserted {
                asset: self.asset_name.clone(),
                key: key.to_owned(),
                value,
            },
            Some(old_value) => MapEvent::Updated {
                asset: self.asset_name.clone(),
                key: key.to_owned(),
                old_value: old_value.clone(),
                value,
            },
        };
        self.emit(event);
        Ok(previous)
    }

    fn put_if_absent(&self, key: &str, value: Value) -> Result<Option<Value>> {
        self.ensure_open()?;
        let existing = match self.map.entry(key.to_owned()) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(value.clone());
                None
            }
        };
        if existing.is_none() {
            self.emit(MapEvent::Inserted {
                asset: self.asset_name.clone(),
                key: key.to_owned(),
                value,
            });
        }
        Ok(existing)
    }

    fn remove(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        let removed = self.map.remove(key).map(|(_, value)| value);
        if let Some(old_value) = &removed {
            self.emit(MapEvent::Removed {
                asset: self.asset_name.clone(),
                key: key.to_owned(),
                old_value: old_value.clone(),
            });
        }
        Ok(removed)
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.map.contains_key(key))
    }

    fn len(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.map.len())
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.map.iter().map(|entry| entry.key().clone()).collect())
    }

    fn entries(&self) -> Result<Vec<(String, Value)>> {
        self.ensure_open()?;
        Ok(self.snapshot())
    }

    fn clear(&self) -> Result<()> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }

    fn subscription(&self) -> Arc<dyn ObjectSubscription> {
        self.subscription.clone()
    }

    fn kind(&self) -> &'static str {
        "vanilla"
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.subscription.close();
        }
    }
}

impl std::fmt::Debug for VanillaKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VanillaKeyValueStore")
            .field("asset", &self.asset_name)
            .field("len", &self.map.len())
            .finish()
    }
}
