//! # 心跳子通道
//!
//! ## 核心意图（Why）
//! - 连接处理器在每条入站消息上刷新“最后可见”时间；本处理器定期发送心跳并检查该时间；
//! - 超过超时仍无任何入站消息，视为对端失联并拆除连接。
//!
//! ## 契约（What）
//! - 描述字段：`heartbeatIntervalMs`、`heartbeatTimeoutMs`，两端使用同一组参数；
//! - 定时任务挂在共享事件循环上，连接关闭时取消；
//! - 没有事件循环视图时只登记监视器，不主动发送心跳。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::cluster_handler::ClusterConnectionHandler;
use super::sub_handler::SubHandler;
use crate::cluster::HostId;
use crate::error::{EngineError, Result};
use crate::threads::ScheduledTask;
use crate::wire::{Document, FieldReader, Fields, HANDLER_TYPE, Value, WireOut};

pub const HEARTBEAT_TYPE: &str = "heartbeat";

const INTERVAL_MS: &str = "heartbeatIntervalMs";
const TIMEOUT_MS: &str = "heartbeatTimeoutMs";
const BEAT: &str = "heartbeat";

/// 入站消息到达时的回调。
pub trait HeartbeatEventHandler: Send + Sync {
    fn on_message_received(&self);
}

/// 记录最后一次入站消息的时间。
#[derive(Debug)]
pub struct HeartbeatMonitor {
    last_seen: Mutex<Instant>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatEventHandler for HeartbeatMonitor {
    fn on_message_received(&self) {
        *self.last_seen.lock() = Instant::now();
    }
}

#[derive(Debug)]
pub struct HeartbeatHandler {
    interval: Duration,
    timeout: Duration,
    monitor: Arc<HeartbeatMonitor>,
    task: Option<ScheduledTask>,
    remote: Option<HostId>,
}

impl HeartbeatHandler {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            monitor: Arc::new(HeartbeatMonitor::new()),
            task: None,
            remote: None,
        }
    }

    pub fn from_descriptor(descriptor: &Fields) -> Result<Self> {
        let interval = Duration::from_millis(descriptor.read_u64(INTERVAL_MS)?);
        let timeout = Duration::from_millis(descriptor.read_u64(TIMEOUT_MS)?);
        if interval.is_zero() {
            return Err(EngineError::wire(INTERVAL_MS, "heartbeat interval must be positive"));
        }
        Ok(Self::new(interval, timeout))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl SubHandler for HeartbeatHandler {
    fn handler_type(&self) -> &str {
        HEARTBEAT_TYPE
    }

    fn descriptor(&self) -> Fields {
        let mut descriptor = Fields::new();
        descriptor.insert(HANDLER_TYPE.to_owned(), Value::from(HEARTBEAT_TYPE));
        descriptor.insert(INTERVAL_MS.to_owned(), Value::from(self.interval.as_millis() as u64));
        descriptor.insert(TIMEOUT_MS.to_owned(), Value::from(self.timeout.as_millis() as u64));
        descriptor
    }

    fn set_identifiers(&mut self, _local: HostId, remote: HostId) {
        self.remote = Some(remote);
    }

    fn on_initialize(&mut self, connection: &Arc<ClusterConnectionHandler>, cid: u64) -> Result<()> {
        connection.bind_heartbeat(self.monitor.clone());
        let Some(event_loop) = connection.event_loop() else {
            debug!(cid, "no event loop bound, heartbeat is receive-only");
            return Ok(());
        };

        let weak: Weak<ClusterConnectionHandler> = Arc::downgrade(connection);
        let monitor = self.monitor.clone();
        let timeout = self.timeout;
        let remote = self.remote;
        let beats = AtomicU64::new(0);
        self.task = Some(event_loop.schedule_repeating(self.interval, move || {
            let Some(connection) = weak.upgrade() else {
                return false;
            };
            if connection.is_closed() {
                return false;
            }
            let silent_for = monitor.elapsed();
            if silent_for > timeout {
                warn!(
                    cid,
                    remote = ?remote,
                    silent_ms = silent_for.as_millis() as u64,
                    "heartbeat timed out, closing connection"
                );
                connection.close();
                return false;
            }
            let beat = beats.fetch_add(1, Ordering::Relaxed);
            connection.publish_on_channel(cid, Document::data().with(BEAT, beat));
            true
        }));
        Ok(())
    }

    fn on_read(
        &mut self,
        _connection: &Arc<ClusterConnectionHandler>,
        cid: u64,
        document: &Document,
        _out: &mut WireOut,
    ) -> Result<()> {
        match document.field(BEAT) {
            Some(beat) => trace!(cid, %beat, "heartbeat received"),
            None => debug!(cid, "non-heartbeat data on heartbeat channel ignored"),
        }
        Ok(())
    }

    fn on_close(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips_through_the_registry() {
        let handler = HeartbeatHandler::new(Duration::from_millis(250), Duration::from_secs(3));
        let rebuilt = HeartbeatHandler::from_descriptor(&handler.descriptor()).expect("描述可解析");
        assert_eq!(rebuilt.interval(), Duration::from_millis(250));
        assert_eq!(rebuilt.timeout(), Duration::from_secs(3));

        let mut zero = handler.descriptor();
        zero.insert(INTERVAL_MS.to_owned(), Value::from(0));
        assert!(HeartbeatHandler::from_descriptor(&zero).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_tracks_last_inbound_message() {
        let monitor = HeartbeatMonitor::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(monitor.elapsed() >= Duration::from_secs(5));
        monitor.on_message_received();
        assert!(monitor.elapsed() < Duration::from_secs(1));
    }
}
