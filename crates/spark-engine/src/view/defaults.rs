//! 服务端默认视图规则。

use std::sync::Arc;

use super::capability::{Capability, View};
use crate::map::{MapReference, MapTopicPublisher, Publisher, VanillaKeyValueStore, VanillaReference};
use crate::pubsub::{JsonValueReader, SimpleSubscription};
use crate::tree::Asset;

/// 在 `root` 上注册默认规则，对整棵树生效。
///
/// | 能力 | 规则 |
/// | --- | --- |
/// | `KeyValueStore` | 叶子：本地 `DashMap` 映射 |
/// | `ObjectSubscription` | 包装 `KeyValueStore`：取映射自带的订阅 |
/// | `TopicPublisher` | 包装 `KeyValueStore`：发布即写键 |
/// | `Reference` | 叶子：父资产已有映射时指向父映射的同名键，否则独立持值 |
/// | `ValueSubscription` | 包装 `Reference`：当前值作为引导 |
/// | `Publisher` | 包装 `Reference`：组合同一资产的值订阅 |
pub fn install_default_rules(root: &Arc<Asset>) {
    root.add_leaf_rule(Capability::KeyValueStore, "vanilla key value store", |_, asset| {
        Ok(View::KeyValueStore(VanillaKeyValueStore::new(asset)))
    });

    root.add_wrapping_rule(
        Capability::ObjectSubscription,
        "map subscription",
        Capability::KeyValueStore,
        |_, asset, underlying| {
            let store = underlying.into_key_value_store(asset.full_name())?;
            Ok(View::ObjectSubscription(store.subscription()))
        },
    );

    root.add_wrapping_rule(
        Capability::TopicPublisher,
        "map topic publisher",
        Capability::KeyValueStore,
        |_, asset, underlying| {
            let store = underlying.into_key_value_store(asset.full_name())?;
            Ok(View::TopicPublisher(Arc::new(MapTopicPublisher::new(store))))
        },
    );

    root.add_leaf_rule(Capability::Reference, "reference", |_, asset| {
        let parent_store = asset
            .parent()
            .and_then(|parent| parent.get_view(Capability::KeyValueStore));
        match parent_store {
            Some(View::KeyValueStore(store)) => Ok(View::Reference(Arc::new(MapReference::new(
                asset.full_name(),
                asset.name(),
                store,
            )))),
            _ => Ok(View::Reference(Arc::new(VanillaReference::new(asset)))),
        }
    });

    root.add_wrapping_rule(
        Capability::ValueSubscription,
        "value subscription",
        Capability::Reference,
        |_, asset, underlying| {
            let reference = underlying.into_reference(asset.full_name())?;
            let current = Arc::new(move || reference.get().ok().flatten());
            Ok(View::ValueSubscription(Arc::new(SimpleSubscription::new(
                current,
                Arc::new(JsonValueReader::any()),
            ))))
        },
    );

    root.add_wrapping_rule(
        Capability::Publisher,
        "publisher",
        Capability::Reference,
        |_, asset, underlying| {
            let reference = underlying.into_reference(asset.full_name())?;
            let subscription = asset.acquire_value_subscription()?;
            Ok(View::Publisher(Arc::new(Publisher::new(reference, subscription))))
        },
    );
}
