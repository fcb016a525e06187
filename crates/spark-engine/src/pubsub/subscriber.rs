use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// 订阅者主动声明自身失效。
///
/// 分发方收到该值后把订阅者移出集合，不再投递任何事件，也不会触发结束回调。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Error)]
#[error("subscriber is no longer valid")]
pub struct InvalidSubscriber;

/// 事件订阅者。
///
/// # 教案式说明
/// - **意图 (Why)**：值订阅、键订阅、条目订阅与主题订阅共用同一回调契约，只是事件类型 `E` 不同；
/// - **契约 (What)**：
///   - `on_message` 返回 `Err(InvalidSubscriber)` 表示请求退订；
///   - 同一订阅者的回调按顺序执行，不会并发进入；
///   - `on_end_of_subscription` 至多调用一次，之后不再有 `on_message`；
/// - **风险 (Trade-offs)**：回调在发布者线程上同步执行，耗时逻辑会拖慢其他订阅者。
pub trait Subscriber<E>: Send + Sync {
    fn on_message(&self, event: &E) -> Result<(), InvalidSubscriber>;

    fn on_end_of_subscription(&self) {}
}

/// 以闭包构造订阅者，测试与轻量场景常用。
pub struct FnSubscriber<F> {
    on_message: F,
}

impl<F> FnSubscriber<F> {
    pub fn new(on_message: F) -> Self {
        Self { on_message }
    }
}

impl<E, F> Subscriber<E> for FnSubscriber<F>
where
    F: Fn(&E) -> Result<(), InvalidSubscriber> + Send + Sync,
{
    fn on_message(&self, event: &E) -> Result<(), InvalidSubscriber> {
        (self.on_message)(event)
    }
}

impl<F> fmt::Debug for FnSubscriber<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnSubscriber")
    }
}

/// 订阅者身份比较：只比较数据指针，忽略虚表。
pub fn same_subscriber<E>(a: &Arc<dyn Subscriber<E>>, b: &Arc<dyn Subscriber<E>>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// 订阅计数视角，值订阅与映射订阅都实现它。
pub trait Subscription: Send + Sync {
    /// 全部订阅者数量。
    fn subscriber_count(&self) -> usize;

    fn key_subscriber_count(&self) -> usize;

    fn entry_subscriber_count(&self) -> usize;

    fn topic_subscriber_count(&self) -> usize;

    /// 向全部订阅者投递结束信号并拒绝后续注册。
    fn close(&self);
}
