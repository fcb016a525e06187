//! 写时复制的订阅者集合。
//!
//! ## 核心意图（Why）
//! - 发布路径远比注册路径频繁：发布只读取一份 `Arc<Vec<_>>` 快照，不持有集合级锁；
//! - 注册与退订通过 `ArcSwap::rcu` 替换整份快照，读写互不阻塞。
//!
//! ## 顺序与隔离（What）
//! - 每个订阅者槽位有一把 `parking_lot::ReentrantMutex` 投递锁与一个原子结束标记：投递与结束回调
//!   都在锁内进行，跨线程串行，且结束回调之后不会再有事件；
//! - 回调内可以对同一集合退订、关闭或再注册：退订只翻转结束标记，不取锁，
//!   关闭与注册在同一线程上可重入；
//! - 注册时先持有新槽位的投递锁再把它放进快照，于是引导值一定早于任何并发发布的事件到达；
//! - 单个订阅者返回失效或发生 panic，只会让它自己被移除，其余订阅者照常收到事件。

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, warn};

use super::subscriber::{Subscriber, same_subscriber};

/// 附着在单个订阅者上的事件过滤器。
pub type EventFilter<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

struct Slot<E> {
    subscriber: Arc<dyn Subscriber<E>>,
    filter: Option<EventFilter<E>>,
    delivery: ReentrantMutex<()>,
    ended: AtomicBool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Delivery {
    Delivered,
    Skipped,
    Invalid,
    Panicked,
}

impl<E> Slot<E> {
    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// 标记结束；返回本次调用是否完成了翻转。
    fn end(&self) -> bool {
        !self.ended.swap(true, Ordering::AcqRel)
    }

    fn deliver(&self, event: &E) -> Delivery {
        if let Some(filter) = &self.filter {
            if !filter(event) {
                return Delivery::Skipped;
            }
        }
        match catch_unwind(AssertUnwindSafe(|| self.subscriber.on_message(event))) {
            Ok(Ok(())) => Delivery::Delivered,
            Ok(Err(_)) => Delivery::Invalid,
            Err(_) => Delivery::Panicked,
        }
    }
}

/// 注册结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Registration {
    /// 新订阅者已加入集合。
    Added,
    /// 同一订阅者已存在，集合不变，也不重放引导值。
    AlreadyPresent,
    /// 引导阶段订阅者声明失效，已被移除。
    Rejected,
    /// 集合已经关闭。
    Closed,
}

impl Registration {
    pub fn is_active(self) -> bool {
        matches!(self, Registration::Added | Registration::AlreadyPresent)
    }
}

/// 订阅者集合。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 订阅者身份按 `Arc` 数据指针判定，同一实例重复注册不会产生重复投递；
///   - `notify` 对快照中的每个订阅者至多投递一次；
///   - `close` 幂等，对每个仍然存活的订阅者调用一次结束回调；
/// - **风险 (Trade-offs)**：注册/退订会复制整份 `Vec`，订阅者规模极大时注册成本线性增长。
pub struct SubscriberSet<E> {
    label: &'static str,
    slots: ArcSwap<Vec<Arc<Slot<E>>>>,
    closed: AtomicBool,
}

impl<E: 'static> SubscriberSet<E> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            slots: ArcSwap::from_pointee(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.load().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn contains(&self, subscriber: &Arc<dyn Subscriber<E>>) -> bool {
        self.slots
            .load()
            .iter()
            .any(|slot| same_subscriber(&slot.subscriber, subscriber))
    }

    /// 注册订阅者并投递引导事件。
    ///
    /// - **执行 (How)**：
    ///   1. 创建槽位并持有其投递锁；
    ///   2. `rcu` 插入快照，若同一订阅者已经存在且未结束，直接返回 `AlreadyPresent`；
    ///   3. 在锁内调用 `bootstrap` 计算引导事件并逐一投递；
    ///   4. 引导期间返回失效或 panic，则标记结束并移出集合。
    /// - **契约 (What)**：`bootstrap` 在订阅者入集之后才计算，与并发发布之间不会丢事件。
    pub fn register<B>(
        &self,
        subscriber: Arc<dyn Subscriber<E>>,
        filter: Option<EventFilter<E>>,
        bootstrap: B,
    ) -> Registration
    where
        B: FnOnce() -> Vec<E>,
    {
        if self.is_closed() {
            debug!(set = self.label, "register on closed subscriber set ignored");
            return Registration::Closed;
        }

        let fresh = Arc::new(Slot {
            subscriber,
            filter,
            delivery: ReentrantMutex::new(()),
            ended: AtomicBool::new(false),
        });
        let guard = fresh.delivery.lock();

        let mut present = false;
        self.slots.rcu(|current| {
            present = current.iter().any(|slot| {
                !slot.is_ended() && same_subscriber(&slot.subscriber, &fresh.subscriber)
            });
            let mut next: Vec<Arc<Slot<E>>> = current.iter().cloned().collect();
            if !present {
                next.push(fresh.clone());
            }
            next
        });
        if present {
            return Registration::AlreadyPresent;
        }
        if self.is_closed() {
            fresh.end();
            self.remove_slot(&fresh);
            return Registration::Closed;
        }
        self.deliver_bootstrap(&fresh, guard, bootstrap)
    }

    fn deliver_bootstrap<B>(
        &self,
        slot: &Arc<Slot<E>>,
        guard: ReentrantMutexGuard<'_, ()>,
        bootstrap: B,
    ) -> Registration
    where
        B: FnOnce() -> Vec<E>,
    {
        for event in bootstrap() {
            if slot.is_ended() {
                break;
            }
            match slot.deliver(&event) {
                Delivery::Delivered | Delivery::Skipped => {}
                Delivery::Invalid | Delivery::Panicked => {
                    slot.end();
                    drop(guard);
                    self.remove_slot(slot);
                    debug!(set = self.label, "subscriber rejected during bootstrap");
                    return Registration::Rejected;
                }
            }
        }
        drop(guard);
        if slot.is_ended() {
            self.remove_slot(slot);
            if self.is_closed() {
                return Registration::Closed;
            }
            return Registration::Rejected;
        }
        Registration::Added
    }

    /// 向快照中的全部订阅者投递事件。
    pub fn notify(&self, event: &E) {
        if self.is_closed() {
            return;
        }
        let snapshot = self.slots.load_full();
        let mut failed: Vec<Arc<Slot<E>>> = Vec::new();
        for slot in snapshot.iter() {
            let _guard = slot.delivery.lock();
            if slot.is_ended() {
                continue;
            }
            match slot.deliver(event) {
                Delivery::Delivered | Delivery::Skipped => {}
                Delivery::Invalid => {
                    slot.end();
                    failed.push(slot.clone());
                }
                Delivery::Panicked => {
                    slot.end();
                    warn!(set = self.label, "subscriber panicked, removing it");
                    failed.push(slot.clone());
                }
            }
        }
        for slot in failed {
            self.remove_slot(&slot);
        }
    }

    /// 按身份退订；不会触发结束回调，也不等待进行中的投递，可在回调内调用。
    pub fn unregister(&self, subscriber: &Arc<dyn Subscriber<E>>) -> bool {
        let mut removed: Vec<Arc<Slot<E>>> = Vec::new();
        self.slots.rcu(|current| {
            removed.clear();
            let mut next = Vec::with_capacity(current.len());
            for slot in current.iter() {
                if same_subscriber(&slot.subscriber, subscriber) {
                    removed.push(slot.clone());
                } else {
                    next.push(slot.clone());
                }
            }
            next
        });
        removed.iter().fold(false, |ended, slot| slot.end() || ended)
    }

    /// 关闭集合，对仍存活的订阅者投递一次结束回调。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let slots = self.slots.swap(Arc::new(Vec::new()));
        for slot in slots.iter() {
            let _guard = slot.delivery.lock();
            if !slot.end() {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                slot.subscriber.on_end_of_subscription()
            }));
            if outcome.is_err() {
                warn!(set = self.label, "subscriber panicked in end of subscription");
            }
        }
    }

    fn remove_slot(&self, target: &Arc<Slot<E>>) {
        self.slots.rcu(|current| {
            current
                .iter()
                .filter(|slot| !Arc::ptr_eq(slot, target))
                .cloned()
                .collect::<Vec<_>>()
        });
    }
}

impl<E> std::fmt::Debug for SubscriberSet<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberSet")
            .field("label", &self.label)
            .field("len", &self.slots.load().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::pubsub::InvalidSubscriber;

    #[derive(Default)]
    struct Recorder {
        seen: PlMutex<Vec<i32>>,
        ended: AtomicUsize,
        reject_at: Option<i32>,
    }

    impl Subscriber<i32> for Recorder {
        fn on_message(&self, event: &i32) -> Result<(), InvalidSubscriber> {
            if self.reject_at == Some(*event) {
                return Err(InvalidSubscriber);
            }
            self.seen.lock().push(*event);
            Ok(())
        }

        fn on_end_of_subscription(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;

    impl Subscriber<i32> for Panicker {
        fn on_message(&self, _: &i32) -> Result<(), InvalidSubscriber> {
            panic!("订阅者内部故障");
        }
    }

    #[test]
    fn bootstrap_precedes_events_and_duplicates_are_ignored() {
        let set: SubscriberSet<i32> = SubscriberSet::new("test");
        let recorder = Arc::new(Recorder::default());
        let handle: Arc<dyn Subscriber<i32>> = recorder.clone();

        assert_eq!(set.register(handle.clone(), None, || vec![1]), Registration::Added);
        assert_eq!(
            set.register(handle.clone(), None, || vec![7]),
            Registration::AlreadyPresent
        );
        assert_eq!(set.len(), 1);

        set.notify(&2);
        assert_eq!(*recorder.seen.lock(), vec![1, 2], "重复注册不重放引导值");
    }

    #[derive(Clone, Copy)]
    enum Reentry {
        UnregisterOnMessage,
        CloseOnMessage,
        RegisterAgainOnMessage,
        UnregisterOnEnd,
    }

    /// 在回调里回头操作所在集合的订阅者。
    struct Reentrant {
        set: Arc<SubscriberSet<i32>>,
        me: std::sync::OnceLock<std::sync::Weak<Reentrant>>,
        reentry: Reentry,
        seen: PlMutex<Vec<i32>>,
        ended: AtomicUsize,
    }

    impl Reentrant {
        fn install(set: &Arc<SubscriberSet<i32>>, reentry: Reentry) -> Arc<Self> {
            let subscriber = Arc::new(Self {
                set: set.clone(),
                me: std::sync::OnceLock::new(),
                reentry,
                seen: PlMutex::new(Vec::new()),
                ended: AtomicUsize::new(0),
            });
            let _ = subscriber.me.set(Arc::downgrade(&subscriber));
            assert_eq!(
                set.register(subscriber.clone(), None, Vec::new),
                Registration::Added
            );
            subscriber
        }

        fn handle(&self) -> Option<Arc<dyn Subscriber<i32>>> {
            let me: Arc<dyn Subscriber<i32>> = self.me.get()?.upgrade()?;
            Some(me)
        }
    }

    impl Subscriber<i32> for Reentrant {
        fn on_message(&self, event: &i32) -> Result<(), InvalidSubscriber> {
            self.seen.lock().push(*event);
            let Some(me) = self.handle() else {
                return Ok(());
            };
            match self.reentry {
                Reentry::UnregisterOnMessage => {
                    self.set.unregister(&me);
                }
                Reentry::CloseOnMessage => self.set.close(),
                Reentry::RegisterAgainOnMessage => {
                    assert_eq!(
                        self.set.register(me, None, || vec![0]),
                        Registration::AlreadyPresent
                    );
                }
                Reentry::UnregisterOnEnd => {}
            }
            Ok(())
        }

        fn on_end_of_subscription(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
            if let (Reentry::UnregisterOnEnd, Some(me)) = (self.reentry, self.handle()) {
                self.set.unregister(&me);
            }
        }
    }

    /// 在工作线程上执行并限时等待，回调重入造成的死锁表现为超时。
    fn within_deadline(work: impl FnOnce() + Send + 'static) {
        let (done, finished) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            work();
            let _ = done.send(());
        });
        finished
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("回调重入集合不应阻塞投递");
    }

    #[test]
    fn callbacks_may_reenter_the_set() {
        for reentry in [
            Reentry::UnregisterOnMessage,
            Reentry::CloseOnMessage,
            Reentry::RegisterAgainOnMessage,
            Reentry::UnregisterOnEnd,
        ] {
            let set = Arc::new(SubscriberSet::new("reentrant"));
            let subscriber = Reentrant::install(&set, reentry);
            let worker_set = set.clone();
            within_deadline(move || {
                worker_set.notify(&1);
                worker_set.notify(&2);
                worker_set.close();
            });
            match reentry {
                Reentry::UnregisterOnMessage => {
                    assert_eq!(*subscriber.seen.lock(), vec![1]);
                    assert_eq!(subscriber.ended.load(Ordering::SeqCst), 0);
                }
                Reentry::CloseOnMessage => {
                    assert_eq!(*subscriber.seen.lock(), vec![1]);
                    assert_eq!(subscriber.ended.load(Ordering::SeqCst), 1);
                }
                Reentry::RegisterAgainOnMessage | Reentry::UnregisterOnEnd => {
                    assert_eq!(*subscriber.seen.lock(), vec![1, 2]);
                    assert_eq!(subscriber.ended.load(Ordering::SeqCst), 1);
                }
            }
            assert!(set.is_empty());
        }
    }

    #[test]
    fn invalid_and_panicking_subscribers_are_isolated() {
        let set: SubscriberSet<i32> = SubscriberSet::new("test");
        let healthy = Arc::new(Recorder::default());
        let quitting = Arc::new(Recorder {
            reject_at: Some(5),
            ..Recorder::default()
        });
        set.register(healthy.clone(), None, Vec::new);
        set.register(quitting.clone(), None, Vec::new);
        set.register(Arc::new(Panicker), None, Vec::new);
        assert_eq!(set.len(), 3);

        set.notify(&5);
        set.notify(&6);
        assert_eq!(*healthy.seen.lock(), vec![5, 6]);
        assert!(quitting.seen.lock().is_empty());
        assert_eq!(set.len(), 1, "失效与 panic 的订阅者都应被移除");
    }

    #[test]
    fn rejected_bootstrap_is_not_retained() {
        let set: SubscriberSet<i32> = SubscriberSet::new("test");
        let quitting = Arc::new(Recorder {
            reject_at: Some(0),
            ..Recorder::default()
        });
        assert_eq!(
            set.register(quitting, None, || vec![0]),
            Registration::Rejected
        );
        assert!(set.is_empty());
    }

    #[test]
    fn close_ends_each_subscriber_once() {
        let set: SubscriberSet<i32> = SubscriberSet::new("test");
        let recorder = Arc::new(Recorder::default());
        set.register(recorder.clone(), None, Vec::new);
        set.close();
        set.close();
        set.notify(&1);
        assert_eq!(recorder.ended.load(Ordering::SeqCst), 1);
        assert!(recorder.seen.lock().is_empty());
        assert_eq!(
            set.register(recorder.clone(), None, Vec::new),
            Registration::Closed
        );
    }

    #[test]
    fn filters_skip_without_removing() {
        let set: SubscriberSet<i32> = SubscriberSet::new("test");
        let recorder = Arc::new(Recorder::default());
        let even: EventFilter<i32> = Arc::new(|v: &i32| v % 2 == 0);
        set.register(recorder.clone(), Some(even), Vec::new);
        for v in 1..=4 {
            set.notify(&v);
        }
        assert_eq!(*recorder.seen.lock(), vec![2, 4]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn unregister_stops_delivery() {
        let set: SubscriberSet<i32> = SubscriberSet::new("test");
        let recorder = Arc::new(Recorder::default());
        let handle: Arc<dyn Subscriber<i32>> = recorder.clone();
        set.register(handle.clone(), None, Vec::new);
        assert!(set.unregister(&handle));
        assert!(!set.unregister(&handle));
        set.notify(&3);
        assert!(recorder.seen.lock().is_empty());
        assert_eq!(recorder.ended.load(Ordering::SeqCst), 0);
    }
}
