//! 出站发布队列与写回调契约。

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use super::document::Document;
use super::out::WireOut;

/// 可写事件的唤醒器，由传输层实现。
pub trait WriteWaker: Send + Sync {
    fn wake(&self);
}

/// 参与写回调轮转的写者。
///
/// - **契约 (What)**：实现者在 `write_to` 中向 `out` 追加零或多条文档；追加后 `out` 非空即视为
///   本轮已经产出数据；
/// - **风险 (Trade-offs)**：`write_to` 在连接的写路径上同步执行，不得阻塞。
pub trait WireWriter: Send + Sync {
    fn write_to(&self, out: &mut WireOut);
}

/// 连接级发布队列。
///
/// # 教案式说明
/// - **意图 (Why)**：握手回显、终止消息与订阅事件可能来自任意线程，统一先入队，
///   再由连接驱动在写回调中批量取出；
/// - **契约 (What)**：`publish` 线程安全且不阻塞；同一次 `publish_all` 的文档在队列中保持相邻，
///   不会被其他线程的文档插入；关闭后拒绝新文档；
/// - **执行 (How)**：`parking_lot::Mutex<VecDeque>` 保存队列，入队后调用 [`WriteWaker::wake`]。
pub struct WireOutPublisher {
    queue: Mutex<VecDeque<Document>>,
    waker: Option<Arc<dyn WriteWaker>>,
    closed: AtomicBool,
}

impl WireOutPublisher {
    pub fn new(waker: Option<Arc<dyn WriteWaker>>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            waker,
            closed: AtomicBool::new(false),
        }
    }

    /// 入队单条文档；已关闭时返回 `false`。
    pub fn publish(&self, document: Document) -> bool {
        self.publish_all(std::iter::once(document))
    }

    /// 原子地入队一组文档。
    pub fn publish_all(&self, documents: impl IntoIterator<Item = Document>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.queue.lock();
            queue.extend(documents);
            trace!(queued = queue.len(), "wire out publisher enqueued");
        }
        if let Some(waker) = &self.waker {
            waker.wake();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 关闭并清空队列。
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.queue.lock().clear();
        }
    }
}

impl WireWriter for WireOutPublisher {
    fn write_to(&self, out: &mut WireOut) {
        let mut queue = self.queue.lock();
        while !out.is_full() {
            match queue.pop_front() {
                Some(document) => {
                    out.push(document);
                }
                None => break,
            }
        }
    }
}

impl std::fmt::Debug for WireOutPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireOutPublisher")
            .field("queued", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountingWaker(AtomicUsize);

    impl WriteWaker for CountingWaker {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn publish_wakes_and_write_respects_capacity() {
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let publisher = WireOutPublisher::new(Some(waker.clone() as Arc<dyn WriteWaker>));
        for i in 0..5 {
            assert!(publisher.publish(Document::data().with("i", i)));
        }
        assert_eq!(waker.0.load(Ordering::SeqCst), 5);

        let mut out = WireOut::new(3);
        publisher.write_to(&mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(publisher.len(), 2, "超出容量的文档应留在队列中");

        publisher.close();
        assert!(!publisher.publish(Document::data()));
        assert!(publisher.is_empty());
    }
}
