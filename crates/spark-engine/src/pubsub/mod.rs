//! # pubsub 模块
//!
//! ## 定位（Why）
//! - 提供订阅者契约、写时复制的订阅者集合与值订阅实现，映射订阅与远程桥接都建立在这里；
//! - 保证单个订阅者失败不会影响其他订阅者，也不会让发布者失败。
//!
//! ## 组成（What）
//! - [`Subscriber`] / [`InvalidSubscriber`]：回调契约与退订信号；
//! - [`SubscriberSet`]：并发安全的订阅者集合；
//! - [`SimpleSubscription`]：单值订阅，带引导投递与字节解码。

mod set;
mod simple;
mod subscriber;

pub use set::{EventFilter, Registration, SubscriberSet};
pub use simple::{
    CurrentValue, JsonValueReader, Message, ReadError, SimpleSubscription, ValueKind, ValueReader,
};
pub use subscriber::{FnSubscriber, InvalidSubscriber, Subscriber, Subscription, same_subscriber};
