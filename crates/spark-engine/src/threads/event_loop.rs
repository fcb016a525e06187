//! # 事件循环（EventLoop）
//!
//! ## 核心意图（Why）
//! - 连接延迟关闭、心跳、远程会话等后台任务需要一个可被资产树统一关闭的执行器；
//! - 视图只是 Tokio 运行时的薄包装：可以自建多线程运行时，也可以借用调用方已有的运行时。
//!
//! ## 契约（What）
//! - `start` 幂等；`close` 幂等，关闭后 `spawn`/`schedule` 变为空操作；
//! - 关闭时所有经本循环派生的任务在下一个挂起点被取消；自建运行时以 `shutdown_background` 释放，
//!   可以在异步上下文中安全调用；
//! - [`ScheduledTask::cancel`] 取消单个定时任务。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// 可取消的定时任务句柄。
#[derive(Debug, Default)]
pub struct ScheduledTask {
    abort: Option<AbortHandle>,
}

impl ScheduledTask {
    /// 事件循环已关闭时返回的空句柄。
    pub fn inert() -> Self {
        Self { abort: None }
    }

    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.abort.as_ref().is_none_or(AbortHandle::is_finished)
    }
}

pub struct EventLoop {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl EventLoop {
    /// 自建多线程运行时。
    pub fn owned(name: &str, worker_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(name)
            .enable_all()
            .build()
            .map_err(|err| EngineError::EventLoop {
                detail: format!("failed to build runtime `{name}`: {err}"),
            })?;
        let handle = runtime.handle().clone();
        Ok(Self::assemble(name, handle, Some(runtime)))
    }

    /// 借用已有运行时；关闭时只取消本循环派生的任务。
    pub fn from_handle(name: &str, handle: Handle) -> Self {
        Self::assemble(name, handle, None)
    }

    /// 处在 Tokio 上下文中时借用当前运行时，否则自建。
    pub fn current_or_owned(name: &str, worker_threads: usize) -> Result<Self> {
        match Handle::try_current() {
            Ok(handle) => Ok(Self::from_handle(name, handle)),
            Err(_) => Self::owned(name, worker_threads),
        }
    }

    fn assemble(name: &str, handle: Handle, runtime: Option<Runtime>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.to_owned(),
            handle,
            runtime: Mutex::new(runtime),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_owned(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// 标记为已启动；返回本次调用是否真正完成了启动。
    pub fn start(&self) -> bool {
        if self.is_closed() || self.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(event_loop = %self.name, owned = self.is_owned(), "event loop started");
        true
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 派生后台任务；关闭后返回 `None`。
    pub fn spawn<F>(&self, future: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            debug!(event_loop = %self.name, "spawn on closed event loop ignored");
            return None;
        }
        let mut shutdown = self.shutdown.subscribe();
        Some(self.handle.spawn(async move {
            tokio::select! {
                _ = future => {}
                _ = shutdown.wait_for(|closed| *closed) => {}
            }
        }))
    }

    /// `delay` 之后执行一次 `task`。
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let spawned = self.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        ScheduledTask {
            abort: spawned.map(|handle| handle.abort_handle()),
        }
    }

    /// 每隔 `interval` 执行一次 `task`，直到其返回 `false` 或任务被取消。
    pub fn schedule_repeating<F>(&self, interval: Duration, mut task: F) -> ScheduledTask
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let spawned = self.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !task() {
                    break;
                }
            }
        });
        ScheduledTask {
            abort: spawned.map(|handle| handle.abort_handle()),
        }
    }

    /// 关闭事件循环；幂等。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!(event_loop = %self.name, "event loop closed");
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name)
            .field("started", &self.is_started())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn schedule_fires_after_delay_and_cancel_prevents_it() {
        let event_loop = EventLoop::current_or_owned("test", 1).expect("借用测试运行时");
        assert!(event_loop.start());
        assert!(!event_loop.start(), "重复启动应为空操作");

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _task = event_loop.schedule(Duration::from_secs(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = fired.clone();
        let cancelled = event_loop.schedule(Duration::from_secs(2), move || {
            counter.fetch_add(100, Ordering::SeqCst);
        });
        cancelled.cancel();

        tokio::time::sleep(Duration::from_millis(1_999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_task_stops_on_false_and_close_stops_everything() {
        let event_loop = EventLoop::current_or_owned("test", 1).expect("借用测试运行时");
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let _task = event_loop.schedule_repeating(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst) < 2
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        let late = Arc::new(AtomicUsize::new(0));
        let counter = late.clone();
        let _pending = event_loop.schedule(Duration::from_millis(500), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        event_loop.close();
        event_loop.close();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(late.load(Ordering::SeqCst), 0, "关闭后的定时任务不应执行");
        assert!(event_loop.spawn(async {}).is_none());
    }

    #[test]
    fn owned_runtime_runs_tasks_outside_tokio() {
        let event_loop = EventLoop::owned("owned-test", 1).expect("创建运行时");
        assert!(event_loop.is_owned());
        let (tx, rx) = std::sync::mpsc::channel();
        let _task = event_loop.schedule(Duration::from_millis(5), move || {
            let _ = tx.send(7);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("定时任务执行"), 7);
        event_loop.close();
        assert!(!event_loop.is_owned());
    }
}
