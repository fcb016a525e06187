//! # 网络上下文
//!
//! ## 核心意图（Why）
//! - 协议处理器需要“唤醒写回调”“关闭底层连接”这两个动作，但不应依赖具体传输；
//! - 同一物理连接上的子通道标识由上下文统一分配。
//!
//! ## 契约（What）
//! - [`ConnectionEvents`] 由传输层实现；`wake` 请求尽快执行一次写回调，`close` 请求拆除连接；
//! - 子通道标识按 `序号 * 2 + 是否接受方` 分配，两端分配的标识互不冲突，`0` 保留给连接自身。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::tree::Asset;
use crate::wire::{WireType, WriteWaker};

/// 连接自身（握手描述）占用的通道标识。
pub const CONNECTION_CID: u64 = 0;

/// 传输层向协议层暴露的连接动作。
pub trait ConnectionEvents: WriteWaker {
    /// 请求拆除底层连接；可以被调用多次。
    fn close(&self);
}

pub struct NetworkContext {
    acceptor: bool,
    root: Arc<Asset>,
    wire_type: Mutex<WireType>,
    events: Arc<dyn ConnectionEvents>,
    next_cid: AtomicU64,
}

impl NetworkContext {
    pub fn new(root: Arc<Asset>, acceptor: bool, events: Arc<dyn ConnectionEvents>) -> Self {
        Self {
            acceptor,
            root,
            wire_type: Mutex::new(WireType::default()),
            events,
            next_cid: AtomicU64::new(1),
        }
    }

    pub fn is_acceptor(&self) -> bool {
        self.acceptor
    }

    pub fn root(&self) -> &Arc<Asset> {
        &self.root
    }

    pub fn wire_type(&self) -> WireType {
        *self.wire_type.lock()
    }

    pub fn set_wire_type(&self, wire_type: WireType) {
        *self.wire_type.lock() = wire_type;
    }

    pub fn events(&self) -> &Arc<dyn ConnectionEvents> {
        &self.events
    }

    /// 作为出站队列唤醒器的同一个事件对象。
    pub fn waker(&self) -> Arc<dyn WriteWaker> {
        self.events.clone()
    }

    pub fn wake_writer(&self) {
        self.events.wake();
    }

    pub fn close_connection(&self) {
        self.events.close();
    }

    /// 分配新的子通道标识。
    pub fn new_cid(&self) -> u64 {
        let sequence = self.next_cid.fetch_add(1, Ordering::Relaxed);
        sequence * 2 + u64::from(self.acceptor)
    }
}

impl fmt::Debug for NetworkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkContext")
            .field("acceptor", &self.acceptor)
            .field("root", &self.root.full_name())
            .field("wire_type", &self.wire_type())
            .finish()
    }
}
