//! # 集群连接处理器
//!
//! ## 核心意图（Why）
//! - 每条集群物理连接对应一个处理器：完成身份握手、解析集群、执行准入策略，
//!   并把多个逻辑出站写者复用到同一个输出缓冲上；
//! - 入站文档按通道头路由到子通道处理器（终止、心跳或注册表中的其他类型）。
//!
//! ## 契约（What）
//! - 握手描述以发送方视角书写，字段名互换：发送方的本地标识写入 `remoteIdentifier`，
//!   接收方直接按字段名读出自己视角的 `(local, remote)`；
//! - `on_initialize` 的顺序：身份校验 → 出站队列 → 事件循环 → 集群解析（缺失则中止，不发送任何消息）
//!   → 接受方回显描述 → 终止回调 → 准入策略；
//! - 策略拒绝时发送一条终止消息，宽限期后关闭；接受时通知 `on_connection_changed(true, ..)`；
//! - `close` 幂等：断开通知最多一次，并且只在此前通知过建立时发出；
//! - 任何子通道的通道头之前到达的数据文档是协议违例。
//!
//! ## 设计权衡
//! - 子通道回调执行期间把处理器从表中取出，回调内部可以安全地关闭连接或打开新子通道；
//! - 写者轮转游标对当前长度取模，写者增删不会越界。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::heartbeat::{HeartbeatEventHandler, HeartbeatHandler};
use super::network_context::{CONNECTION_CID, NetworkContext};
use super::state::{ConnectionState, InitOutcome};
use super::sub_handler::{
    LOCAL_IDENTIFIER, REMOTE_IDENTIFIER, SubHandler, sub_channel_header, termination_document,
};
use crate::cluster::{
    ConnectionChangedNotifier, EngineCluster, HostId, TerminationEventHandler,
};
use crate::error::{EngineError, Result};
use crate::threads::{EventLoop, ScheduledTask};
use crate::view::{Capability, View};
use crate::wire::{
    CID, Document, FieldReader, Fields, HANDLER, HANDLER_TYPE, Value, WireOut, WireOutPublisher,
    WireType, WireWriter,
};

/// 握手描述的类型名。
pub const CLUSTER_HANDLER_TYPE: &str = "cluster";
/// 握手描述中的线格式字段。
pub const WIRE_TYPE: &str = "wireType";
/// 握手描述中的集群名字段。
pub const CLUSTER_NAME: &str = "clusterName";

#[derive(Default)]
struct Channels {
    handlers: HashMap<u64, Box<dyn SubHandler>>,
    current: Option<u64>,
}

pub struct ClusterConnectionHandler {
    local: HostId,
    remote: HostId,
    cluster_name: String,
    wire_type: WireType,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
    connected: AtomicBool,
    network: OnceLock<Arc<NetworkContext>>,
    publisher: OnceLock<Arc<WireOutPublisher>>,
    cluster: OnceLock<Arc<EngineCluster>>,
    event_loop: OnceLock<Arc<EventLoop>>,
    writers: RwLock<Vec<Arc<dyn WireWriter>>>,
    cursor: AtomicUsize,
    notifier: Mutex<Option<Arc<dyn ConnectionChangedNotifier>>>,
    termination: Mutex<Option<Arc<dyn TerminationEventHandler>>>,
    heartbeat: Mutex<Option<Arc<dyn HeartbeatEventHandler>>>,
    channels: Mutex<Channels>,
    delayed_close: Mutex<Option<ScheduledTask>>,
}

impl ClusterConnectionHandler {
    /// 连接方构造。
    ///
    /// # Panics
    /// `local == remote` 表示部署配置错误，直接 panic。
    pub fn new(
        local: HostId,
        remote: HostId,
        cluster_name: impl Into<String>,
        wire_type: WireType,
    ) -> Arc<Self> {
        assert_ne!(
            local, remote,
            "cluster connection to self: local and remote identifier are both {local}"
        );
        Arc::new(Self::assemble(local, remote, cluster_name.into(), wire_type))
    }

    /// 接受方按对端发来的握手描述构造；自连接返回 [`EngineError::SelfConnection`]。
    pub fn from_descriptor(descriptor: &Fields) -> Result<Arc<Self>> {
        let handler_type = descriptor.read_text(HANDLER_TYPE)?;
        if handler_type != CLUSTER_HANDLER_TYPE {
            return Err(EngineError::protocol(format!(
                "expected a `{CLUSTER_HANDLER_TYPE}` handshake, found `{handler_type}`"
            )));
        }
        let local = descriptor.read_i32(LOCAL_IDENTIFIER)?;
        let remote = descriptor.read_i32(REMOTE_IDENTIFIER)?;
        if local == remote {
            return Err(EngineError::SelfConnection { identifier: local });
        }
        let wire_type = descriptor.read_wire_type(WIRE_TYPE)?;
        let cluster_name = descriptor.read_text(CLUSTER_NAME)?.to_owned();
        Ok(Arc::new(Self::assemble(local, remote, cluster_name, wire_type)))
    }

    fn assemble(local: HostId, remote: HostId, cluster_name: String, wire_type: WireType) -> Self {
        Self {
            local,
            remote,
            cluster_name,
            wire_type,
            state: Mutex::new(ConnectionState::Created),
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            network: OnceLock::new(),
            publisher: OnceLock::new(),
            cluster: OnceLock::new(),
            event_loop: OnceLock::new(),
            writers: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            notifier: Mutex::new(None),
            termination: Mutex::new(None),
            heartbeat: Mutex::new(None),
            channels: Mutex::new(Channels::default()),
            delayed_close: Mutex::new(None),
        }
    }

    pub fn local_identifier(&self) -> HostId {
        self.local
    }

    pub fn remote_identifier(&self) -> HostId {
        self.remote
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn wire_type(&self) -> WireType {
        self.wire_type
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 是否已经通知过连接建立且尚未断开。
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn network(&self) -> Option<&Arc<NetworkContext>> {
        self.network.get()
    }

    pub fn cluster(&self) -> Option<&Arc<EngineCluster>> {
        self.cluster.get()
    }

    pub fn event_loop(&self) -> Option<Arc<EventLoop>> {
        self.event_loop.get().cloned()
    }

    pub fn termination_handler(&self) -> Option<Arc<dyn TerminationEventHandler>> {
        self.termination.lock().clone()
    }

    /// 以发送方视角书写的握手描述。
    pub fn descriptor(&self) -> Fields {
        let mut descriptor = Fields::new();
        descriptor.insert(HANDLER_TYPE.to_owned(), Value::from(CLUSTER_HANDLER_TYPE));
        descriptor.insert(REMOTE_IDENTIFIER.to_owned(), Value::from(self.local));
        descriptor.insert(LOCAL_IDENTIFIER.to_owned(), Value::from(self.remote));
        descriptor.insert(WIRE_TYPE.to_owned(), Value::from(self.wire_type.as_str()));
        descriptor.insert(CLUSTER_NAME.to_owned(), Value::from(self.cluster_name.as_str()));
        descriptor
    }

    /// 连接自身通道上的握手通道头。
    pub fn handshake_document(&self) -> Document {
        sub_channel_header(CONNECTION_CID, self.descriptor())
    }

    fn advance(&self, next: ConnectionState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(EngineError::protocol(format!(
                "illegal connection transition {} -> {}",
                state.as_str(),
                next.as_str()
            )));
        }
        *state = next;
        Ok(())
    }

    /// 握手完成后的初始化。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 返回 [`InitOutcome::Aborted`] 时没有发送任何协议消息，由传输层决定是否拆除连接；
    ///   - 返回 [`InitOutcome::Rejected`] 时终止消息已入队，宽限期后自动关闭；
    ///   - 本地标识与本机 HostIdentifier 不一致时返回错误并关闭连接；
    ///   - 重复调用返回协议违例。
    /// - **执行 (How)**：见模块文档中的顺序；策略与通知回调在调用线程上同步执行。
    pub fn on_initialize(self: &Arc<Self>, network: Arc<NetworkContext>) -> Result<InitOutcome> {
        if self.is_closed() {
            return Err(EngineError::closed("cluster connection"));
        }
        self.advance(ConnectionState::HandshakeRead)?;
        let _ = self.network.set(network.clone());

        if let Some(host) = network.root().host_identifier()
            && host.host_id() != self.local
        {
            error!(
                local = self.local,
                host = host.host_id(),
                "handshake local identifier does not match this host"
            );
            self.close();
            return Err(EngineError::IdentityMismatch {
                local: self.local,
                host: host.host_id(),
            });
        }
        self.advance(ConnectionState::IdentityChecked)?;

        network.set_wire_type(self.wire_type);
        let publisher = Arc::new(WireOutPublisher::new(Some(network.waker())));
        if self.publisher.set(publisher.clone()).is_ok() {
            self.writers.write().push(publisher);
        }
        if let Some(View::EventLoop(event_loop)) = network.root().find_view(Capability::EventLoop) {
            event_loop.start();
            let _ = self.event_loop.set(event_loop);
        }

        let cluster = network
            .root()
            .acquire_clusters()
            .ok()
            .and_then(|clusters| clusters.get(&self.cluster_name));
        let Some(cluster) = cluster else {
            error!(
                cluster = %self.cluster_name,
                local = self.local,
                remote = self.remote,
                "cluster not found, connection initialization aborted"
            );
            return Ok(InitOutcome::Aborted);
        };
        self.advance(ConnectionState::ClusterResolved)?;
        let _ = self.cluster.set(cluster.clone());

        if network.is_acceptor() {
            self.publish(self.handshake_document());
        }

        *self.termination.lock() = cluster.find_termination_handler(self.remote);

        let accepted = cluster
            .find_connection_strategy(self.remote)
            .is_none_or(|strategy| strategy.notify_connected(self, self.local, self.remote));
        self.advance(ConnectionState::StrategyChecked)?;

        if !accepted {
            info!(
                cluster = %self.cluster_name,
                local = self.local,
                remote = self.remote,
                "connection rejected by strategy, sending termination"
            );
            self.advance(ConnectionState::Terminating)?;
            self.publish(termination_document(self.local, self.remote, network.new_cid()));
            self.close_soon(cluster.timing().termination_grace);
            return Ok(InitOutcome::Rejected);
        }

        self.advance(ConnectionState::Established)?;
        let notifier = cluster.find_connection_notifier(self.remote);
        *self.notifier.lock() = notifier.clone();
        self.connected.store(true, Ordering::Release);
        if let Some(notifier) = notifier {
            notifier.on_connection_changed(true, &network);
        }
        info!(
            cluster = %self.cluster_name,
            local = self.local,
            remote = self.remote,
            acceptor = network.is_acceptor(),
            "cluster connection established"
        );

        let timing = cluster.timing();
        if !network.is_acceptor()
            && let Some(interval) = timing.heartbeat_interval
        {
            self.open_sub_channel(Box::new(HeartbeatHandler::new(
                interval,
                timing.heartbeat_timeout,
            )))?;
        }
        Ok(InitOutcome::Established)
    }

    /// 处理一条入站文档。
    pub fn on_read(self: &Arc<Self>, document: &Document, out: &mut WireOut) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let heartbeat = self.heartbeat.lock().clone();
        if let Some(heartbeat) = heartbeat {
            heartbeat.on_message_received();
        }
        if self.state() == ConnectionState::Terminating {
            debug!(remote = self.remote, "inbound document ignored while terminating");
            return Ok(());
        }

        if document.is_meta_data() {
            return self.on_header(document);
        }

        let current = self.channels.lock().current;
        let cid = current.ok_or_else(|| {
            EngineError::protocol("data document received before any channel header")
        })?;
        if cid == CONNECTION_CID {
            return Err(EngineError::protocol(
                "data document addressed to the connection channel",
            ));
        }
        let handler = self.channels.lock().handlers.remove(&cid);
        let mut handler = handler.ok_or_else(|| {
            EngineError::protocol(format!("channel {cid} has no handler"))
        })?;
        let result = handler.on_read(self, cid, document, out);
        self.reinsert(cid, handler);
        result
    }

    fn on_header(self: &Arc<Self>, document: &Document) -> Result<()> {
        let cid = document.read_u64(CID)?;
        let Some(descriptor) = document.field(HANDLER) else {
            let mut channels = self.channels.lock();
            if cid != CONNECTION_CID && !channels.handlers.contains_key(&cid) {
                return Err(EngineError::protocol(format!(
                    "header switches to unknown channel {cid}"
                )));
            }
            channels.current = Some(cid);
            return Ok(());
        };
        let descriptor = descriptor
            .as_object()
            .ok_or_else(|| EngineError::wire(HANDLER, "expected an object"))?;

        if cid == CONNECTION_CID {
            self.verify_peer_descriptor(descriptor)?;
            self.channels.lock().current = Some(cid);
            return Ok(());
        }

        let network = self
            .network
            .get()
            .ok_or_else(|| EngineError::protocol("sub channel header before initialization"))?;
        let mut handler = network.root().context().sub_handlers().create(descriptor)?;
        handler.set_identifiers(self.local, self.remote);
        debug!(cid, handler = handler.handler_type(), "sub channel opened by peer");
        self.channels.lock().current = Some(cid);
        self.install_channel(cid, handler)
    }

    fn verify_peer_descriptor(&self, descriptor: &Fields) -> Result<()> {
        let local = descriptor.read_i32(LOCAL_IDENTIFIER)?;
        let remote = descriptor.read_i32(REMOTE_IDENTIFIER)?;
        if local != self.local || remote != self.remote {
            return Err(EngineError::protocol(format!(
                "peer handshake addressed ({local}, {remote}), expected ({}, {})",
                self.local, self.remote
            )));
        }
        Ok(())
    }

    fn install_channel(self: &Arc<Self>, cid: u64, mut handler: Box<dyn SubHandler>) -> Result<()> {
        let previous = self.channels.lock().handlers.remove(&cid);
        if let Some(mut previous) = previous {
            previous.on_close();
        }
        let result = handler.on_initialize(self, cid);
        self.reinsert(cid, handler);
        result
    }

    fn reinsert(&self, cid: u64, mut handler: Box<dyn SubHandler>) {
        let mut channels = self.channels.lock();
        if self.is_closed() {
            drop(channels);
            handler.on_close();
        } else {
            channels.handlers.insert(cid, handler);
        }
    }

    /// 由本端打开子通道：分配标识、发送通道头并在本地初始化处理器。
    pub fn open_sub_channel(self: &Arc<Self>, mut handler: Box<dyn SubHandler>) -> Result<u64> {
        let network = self
            .network
            .get()
            .ok_or_else(|| EngineError::protocol("connection is not initialized"))?;
        let cid = network.new_cid();
        handler.set_identifiers(self.local, self.remote);
        self.publish(sub_channel_header(cid, handler.descriptor()));
        debug!(cid, handler = handler.handler_type(), "sub channel opened");
        self.install_channel(cid, handler)?;
        Ok(cid)
    }

    pub fn sub_channel_count(&self) -> usize {
        self.channels.lock().handlers.len()
    }

    /// 轮转调用出站写者。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：每次从游标位置开始依次询问写者，一旦输出缓冲非空即停止；
    ///   没有写者产出时，一轮最多询问每个写者一次；
    /// - **执行 (How)**：先复制写者快照，游标以 `fetch_update` 对快照长度取模后推进，
    ///   并发调用各自领到不同的位置。
    pub fn on_write(&self, out: &mut WireOut) {
        if self.is_closed() {
            return;
        }
        let writers = self.writers.read().clone();
        let len = writers.len();
        for _ in 0..len {
            let index = self
                .cursor
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                    Some((cursor % len + 1) % len)
                })
                .unwrap_or_else(|cursor| cursor)
                % len;
            writers[index].write_to(out);
            if !out.is_empty() {
                break;
            }
        }
    }

    pub fn add_writer(&self, writer: Arc<dyn WireWriter>) {
        self.writers.write().push(writer);
        if let Some(network) = self.network.get() {
            network.wake_writer();
        }
    }

    pub fn remove_writer(&self, writer: &Arc<dyn WireWriter>) -> bool {
        let target = Arc::as_ptr(writer) as *const ();
        let mut writers = self.writers.write();
        let before = writers.len();
        writers.retain(|candidate| Arc::as_ptr(candidate) as *const () != target);
        writers.len() != before
    }

    pub fn writer_count(&self) -> usize {
        self.writers.read().len()
    }

    /// 把文档放入连接出站队列；未初始化或已关闭时返回 `false`。
    pub fn publish(&self, document: Document) -> bool {
        self.publisher
            .get()
            .is_some_and(|publisher| publisher.publish(document))
    }

    /// 原子地发送 `通道头 + 数据`。
    pub fn publish_on_channel(&self, cid: u64, data: Document) -> bool {
        self.publisher.get().is_some_and(|publisher| {
            publisher.publish_all([Document::channel_header(cid), data])
        })
    }

    pub(crate) fn bind_heartbeat(&self, heartbeat: Arc<dyn HeartbeatEventHandler>) {
        *self.heartbeat.lock() = Some(heartbeat);
    }

    /// 主动结束连接：通知对端并在宽限期后关闭。
    pub fn terminate(self: &Arc<Self>) {
        if self.is_closed() || self.advance(ConnectionState::Terminating).is_err() {
            warn!(state = self.state().as_str(), "terminate ignored in current state");
            return;
        }
        if let Some(network) = self.network.get() {
            self.publish(termination_document(self.local, self.remote, network.new_cid()));
        }
        let grace = self
            .cluster
            .get()
            .map(|cluster| cluster.timing().termination_grace)
            .unwrap_or(crate::cluster::DEFAULT_TERMINATION_GRACE);
        self.close_soon(grace);
    }

    /// 宽限期后关闭；没有可用事件循环时立即关闭。
    pub fn close_soon(self: &Arc<Self>, grace: Duration) {
        match self.event_loop.get() {
            Some(event_loop) if !event_loop.is_closed() => {
                let weak = Arc::downgrade(self);
                let task = event_loop.schedule(grace, move || {
                    if let Some(handler) = weak.upgrade() {
                        handler.close();
                    }
                });
                *self.delayed_close.lock() = Some(task);
            }
            _ => self.close(),
        }
    }

    /// 关闭连接；并发调用时只有一次生效。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock() = ConnectionState::Closed;
        if let Some(task) = self.delayed_close.lock().take() {
            task.cancel();
        }
        let drained: Vec<_> = {
            let mut channels = self.channels.lock();
            channels.current = None;
            channels.handlers.drain().map(|(_, handler)| handler).collect()
        };
        for mut handler in drained {
            handler.on_close();
        }
        self.heartbeat.lock().take();

        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        let notifier = self.notifier.lock().take();
        if was_connected
            && let (Some(notifier), Some(network)) = (notifier, self.network.get())
        {
            notifier.on_connection_changed(false, network);
        }
        if let Some(publisher) = self.publisher.get() {
            publisher.close();
        }
        if let Some(network) = self.network.get() {
            network.close_connection();
        }
        info!(
            cluster = %self.cluster_name,
            local = self.local,
            remote = self.remote,
            "cluster connection closed"
        );
    }
}

impl fmt::Debug for ClusterConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConnectionHandler")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("cluster", &self.cluster_name)
            .field("wire_type", &self.wire_type)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_swaps_identifiers_for_the_peer() {
        let connector = ClusterConnectionHandler::new(1, 2, "blue", WireType::Json);
        let handshake = connector.handshake_document();
        assert_eq!(handshake.cid(), Some(CONNECTION_CID));
        let descriptor = handshake.read_object(HANDLER).expect("握手携带描述");

        let acceptor = ClusterConnectionHandler::from_descriptor(descriptor).expect("合法握手");
        assert_eq!(acceptor.local_identifier(), 2);
        assert_eq!(acceptor.remote_identifier(), 1);
        assert_eq!(acceptor.cluster_name(), "blue");
        assert_eq!(acceptor.wire_type(), WireType::Json);
        assert_eq!(acceptor.state(), ConnectionState::Created);

        let echo = acceptor.descriptor();
        connector
            .verify_peer_descriptor(&echo)
            .expect("回显描述应与连接方视角一致");
        assert!(acceptor.verify_peer_descriptor(&echo).is_err());
    }

    #[test]
    fn self_connection_descriptor_is_rejected() {
        let mut descriptor = ClusterConnectionHandler::new(1, 2, "blue", WireType::Binary).descriptor();
        descriptor.insert(LOCAL_IDENTIFIER.to_owned(), Value::from(1));
        let err = ClusterConnectionHandler::from_descriptor(&descriptor).expect_err("自连接");
        assert_eq!(err, EngineError::SelfConnection { identifier: 1 });
    }

    #[test]
    #[should_panic(expected = "cluster connection to self")]
    fn constructing_a_self_connection_panics() {
        let _ = ClusterConnectionHandler::new(3, 3, "blue", WireType::Binary);
    }

    #[test]
    fn close_before_initialize_is_quiet_and_idempotent() {
        let handler = ClusterConnectionHandler::new(1, 2, "blue", WireType::Binary);
        handler.close();
        handler.close();
        assert!(handler.is_closed());
        assert_eq!(handler.state(), ConnectionState::Closed);
        assert!(!handler.publish(Document::data()));
    }
}
