//! # map 模块
//!
//! ## 定位（Why）
//! - 键值映射是资产树上最常见的数据视图；引用、发布者与主题发布者都构建在映射或单值之上；
//! - 映射订阅把每次变更分发给键、条目、主题三类订阅者，并转发给同名子资产。
//!
//! ## 组成（What）
//! - [`KeyValueStore`] / [`VanillaKeyValueStore`]：映射接口与本地实现；
//! - [`ObjectSubscription`] / [`MapKvSubscription`]：映射订阅；
//! - [`Reference`]、[`Publisher`]、[`TopicPublisher`]：单值与主题视图。

mod event;
mod reference;
mod store;
mod subscription;
mod topic;

pub use event::{MapEvent, TopicMessage};
pub use reference::{MapReference, Publisher, Reference, VanillaReference};
pub use store::{KeyValueStore, VanillaKeyValueStore};
pub use subscription::{MapKvSubscription, ObjectSubscription};
pub use topic::{MapTopicPublisher, TopicPublisher};
