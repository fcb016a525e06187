//! 远程客户端连接：有序故障转移、请求关联与订阅重放。

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender, sync_channel};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use spark_engine::map::TopicMessage;
use spark_engine::server::ConnectionEvents;
use spark_engine::wire::{Value, WireOut, WireOutPublisher, WriteWaker};
use spark_engine::{
    Capability, ClientConnectionMonitor, Document, EngineError, EventLoop, InvalidSubscriber,
    MapEvent, Registration, SessionDetails, Subscriber,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cid::CidSpace;
use crate::driver::{
    DEFAULT_HANDSHAKE_TIMEOUT, FrameReader, FrameWriter, SocketEvents, connect_stream, frame,
    write_queued,
};
use crate::error::{Result, TransportError};
use crate::protocol::{self, Inbound, Op, TARGET};

/// 远程连接选项。
#[derive(Clone, Debug)]
pub struct RemoteOptions {
    connect_timeout: Duration,
    request_timeout: Duration,
    retry_delay: Duration,
}

impl RemoteOptions {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            request_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 单个请求（含等待可用连接）的总时限。
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// 所有端点都连接失败后，开始下一轮之前的等待。
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// 远程订阅在本地的接收者。
#[derive(Clone)]
pub(crate) enum LocalSubscriber {
    Keys(Arc<dyn Subscriber<String>>),
    Entries(Arc<dyn Subscriber<MapEvent>>),
    Topics(Arc<dyn Subscriber<TopicMessage>>),
}

impl LocalSubscriber {
    pub(crate) fn op(&self) -> Op {
        match self {
            LocalSubscriber::Keys(_) => Op::SubscribeKeys,
            LocalSubscriber::Entries(_) => Op::SubscribeEntries,
            LocalSubscriber::Topics(_) => Op::SubscribeTopics,
        }
    }

    fn same_as(&self, other: &LocalSubscriber) -> bool {
        fn data_ptr<T: ?Sized>(arc: &Arc<T>) -> *const () {
            Arc::as_ptr(arc) as *const ()
        }
        match (self, other) {
            (LocalSubscriber::Keys(a), LocalSubscriber::Keys(b)) => data_ptr(a) == data_ptr(b),
            (LocalSubscriber::Entries(a), LocalSubscriber::Entries(b)) => {
                data_ptr(a) == data_ptr(b)
            }
            (LocalSubscriber::Topics(a), LocalSubscriber::Topics(b)) => data_ptr(a) == data_ptr(b),
            _ => false,
        }
    }

    /// 投递一条远程事件；返回 `false` 表示订阅者失效，应当退订。
    fn deliver(&self, tid: u64, payload: &Value) -> bool {
        match self {
            LocalSubscriber::Keys(subscriber) => deliver_decoded(subscriber.as_ref(), tid, payload),
            LocalSubscriber::Entries(subscriber) => {
                deliver_decoded(subscriber.as_ref(), tid, payload)
            }
            LocalSubscriber::Topics(subscriber) => {
                deliver_decoded(subscriber.as_ref(), tid, payload)
            }
        }
    }

    fn end(&self) {
        let ended = catch_unwind(AssertUnwindSafe(|| match self {
            LocalSubscriber::Keys(subscriber) => subscriber.on_end_of_subscription(),
            LocalSubscriber::Entries(subscriber) => subscriber.on_end_of_subscription(),
            LocalSubscriber::Topics(subscriber) => subscriber.on_end_of_subscription(),
        }));
        if ended.is_err() {
            warn!("remote subscriber panicked in end of subscription");
        }
    }
}

fn deliver_decoded<E: DeserializeOwned>(
    subscriber: &dyn Subscriber<E>,
    tid: u64,
    payload: &Value,
) -> bool {
    let event: E = match serde_json::from_value(payload.clone()) {
        Ok(event) => event,
        Err(err) => {
            error!(tid, error = %err, "remote event does not decode, skipped");
            return true;
        }
    };
    match catch_unwind(AssertUnwindSafe(|| subscriber.on_message(&event))) {
        Ok(Ok(())) => true,
        Ok(Err(InvalidSubscriber)) => {
            debug!(tid, "remote subscriber declared itself invalid");
            false
        }
        Err(_) => {
            warn!(tid, "remote subscriber panicked, unsubscribing");
            false
        }
    }
}

struct RemoteSubscription {
    cid: u64,
    request: Document,
    subscriber: LocalSubscriber,
    sent_on: Option<u64>,
}

/// 当前正在使用的一条物理连接。
struct Link {
    generation: u64,
    endpoint: String,
    outbound: WireOutPublisher,
    events: Arc<SocketEvents>,
    opened: Mutex<HashSet<u64>>,
}

impl Link {
    /// 发送一对通道头与数据；通道在本连接上第一次使用时发送完整通道头。
    fn send(&self, cids: &CidSpace, cid: u64, data: Document) -> bool {
        let mut opened = self.opened.lock();
        let header = if opened.contains(&cid) {
            Document::channel_header(cid)
        } else {
            let Some(target) = cids.lookup(cid) else {
                return false;
            };
            opened.insert(cid);
            protocol::channel_open(cid, &target)
        };
        self.outbound.publish_all([header, data])
    }

    fn is_usable(&self) -> bool {
        !self.events.is_closed() && !self.outbound.is_closed()
    }
}

/// 到一组有序端点的远程会话连接。
///
/// # 教案式说明
/// - **意图 (Why)**：让远程映射、订阅与主题发布者视图共享一条会话连接，
///   端点失效时按顺序切换到下一个端点，调用方无需感知；
/// - **契约 (What)**：
///   - 监督任务运行在资产树的事件循环上，端点按给定顺序尝试，断开后从下一个端点继续；
///     一整轮都连接失败时等待 `retry_delay` 再开始下一轮；
///   - 每次建立连接后调用监视器的 `on_connected`，断开后调用 `on_disconnected`；
///   - 已登记的远程订阅在新连接上以原 `tid` 重新注册，引导事件可能重复投递；
///   - 请求在连接断开时以 [`TransportError::ConnectionClosed`] 失败，不会自动重试；
/// - **风险 (Trade-offs)**：
///   - 视图方法是同步的，调用线程阻塞等待回复；不要在事件循环的工作线程上调用，
///     尤其不要在远程订阅者回调里再发起远程请求；
///   - 通道标识从不回收。
pub struct RemoteConnection {
    name: String,
    endpoints: Vec<String>,
    session: SessionDetails,
    monitor: Option<Arc<dyn ClientConnectionMonitor>>,
    options: RemoteOptions,
    cids: CidSpace,
    next_tid: AtomicU64,
    generations: AtomicU64,
    link: Mutex<Option<Arc<Link>>>,
    link_changed: Condvar,
    pending: DashMap<u64, SyncSender<Inbound>>,
    subscriptions: DashMap<u64, RemoteSubscription>,
    shutdown: CancellationToken,
}

impl RemoteConnection {
    /// 创建连接并在 `event_loop` 上启动监督任务；返回时连接可能尚未建立。
    pub fn connect(
        event_loop: &EventLoop,
        endpoints: &[&str],
        session: SessionDetails,
        monitor: Option<Arc<dyn ClientConnectionMonitor>>,
        options: RemoteOptions,
    ) -> Result<Arc<Self>> {
        if endpoints.is_empty() {
            return Err(EngineError::config("remote access needs at least one endpoint").into());
        }
        let connection = Arc::new(Self {
            name: endpoints.join(","),
            endpoints: endpoints.iter().map(|endpoint| (*endpoint).to_owned()).collect(),
            session,
            monitor,
            options,
            cids: CidSpace::new(),
            next_tid: AtomicU64::new(1),
            generations: AtomicU64::new(1),
            link: Mutex::new(None),
            link_changed: Condvar::new(),
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
            shutdown: CancellationToken::new(),
        });
        event_loop.start();
        let supervisor = connection.clone();
        if event_loop.spawn(supervisor.supervise()).is_none() {
            return Err(EngineError::closed(format!("event loop `{}`", event_loop.name())).into());
        }
        info!(
            name = %connection.name,
            user = %connection.session.user_id,
            wire_type = %connection.session.wire_type,
            "remote access started"
        );
        Ok(connection)
    }

    /// 端点列表拼接而成的连接名。
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &SessionDetails {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|link| link.is_usable())
    }

    /// 当前连接的端点。
    pub fn current_endpoint(&self) -> Option<String> {
        self.link
            .lock()
            .as_ref()
            .filter(|link| link.is_usable())
            .map(|link| link.endpoint.clone())
    }

    /// 阻塞等待连接建立，超时返回 `false`。
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut link = self.link.lock();
        loop {
            if link.as_ref().is_some_and(|link| link.is_usable()) {
                return true;
            }
            if self.shutdown.is_cancelled()
                || self.link_changed.wait_until(&mut link, deadline).timed_out()
            {
                return link.as_ref().is_some_and(|link| link.is_usable());
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 关闭连接并结束全部远程订阅；幂等。
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        {
            let _link = self.link.lock();
            self.link_changed.notify_all();
        }
        let tids: Vec<u64> = self.subscriptions.iter().map(|entry| *entry.key()).collect();
        for tid in tids {
            if let Some((_, subscription)) = self.subscriptions.remove(&tid) {
                subscription.subscriber.end();
            }
        }
        self.pending.clear();
        info!(name = %self.name, "remote access closed");
    }

    pub(crate) fn channel(&self, csp: &str, capability: Capability) -> u64 {
        self.cids.acquire(csp, capability)
    }

    fn next_tid(&self) -> u64 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn wait_link(&self, tid: u64, deadline: Instant) -> Result<Arc<Link>> {
        let mut link = self.link.lock();
        loop {
            if self.shutdown.is_cancelled() {
                return Err(TransportError::closed(self.name.clone()));
            }
            if let Some(current) = link.as_ref()
                && current.is_usable()
            {
                return Ok(current.clone());
            }
            if self.link_changed.wait_until(&mut link, deadline).timed_out() {
                return Err(TransportError::RequestTimeout {
                    tid,
                    timeout: self.options.request_timeout,
                });
            }
        }
    }

    /// 发送一个已分配 `tid` 的请求并阻塞等待回复。
    fn exchange(&self, tid: u64, send: impl FnOnce(&Link) -> bool) -> Result<Value> {
        let deadline = Instant::now() + self.options.request_timeout;
        let link = self.wait_link(tid, deadline)?;
        let (reply_tx, reply_rx) = sync_channel(1);
        self.pending.insert(tid, reply_tx);
        if !send(&link) {
            self.pending.remove(&tid);
            return Err(TransportError::closed(self.name.clone()));
        }
        let result = match reply_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(inbound) => inbound.into_reply(),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::RequestTimeout {
                tid,
                timeout: self.options.request_timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::closed(self.name.clone())),
        };
        self.pending.remove(&tid);
        result
    }

    /// 在通道 `cid` 上执行一次请求。
    pub(crate) fn call(
        &self,
        cid: u64,
        op: Op,
        build: impl FnOnce(Document) -> Document,
    ) -> Result<Value> {
        let tid = self.next_tid();
        let request = build(protocol::request(tid, op));
        self.exchange(tid, |link| link.send(&self.cids, cid, request))
    }

    /// 登记并发送远程订阅；连接断开或注册未生效时撤销登记。
    pub(crate) fn subscribe(
        &self,
        cid: u64,
        subscriber: LocalSubscriber,
        build: impl FnOnce(Document) -> Document,
    ) -> Registration {
        if self.shutdown.is_cancelled() {
            return Registration::Closed;
        }
        let duplicate = self
            .subscriptions
            .iter()
            .any(|entry| entry.cid == cid && entry.subscriber.same_as(&subscriber));
        if duplicate {
            return Registration::AlreadyPresent;
        }
        let tid = self.next_tid();
        let request = build(protocol::request(tid, subscriber.op()));
        self.subscriptions.insert(
            tid,
            RemoteSubscription {
                cid,
                request,
                subscriber,
                sent_on: None,
            },
        );
        let registration = match self.exchange(tid, |link| self.send_subscription(link, tid)) {
            Ok(reply) => protocol::parse_registration(&reply).unwrap_or(Registration::Closed),
            Err(err) => {
                warn!(name = %self.name, tid, code = err.code(), error = %err, "remote subscribe failed");
                self.send_unsubscribe(cid, tid);
                Registration::Closed
            }
        };
        if !registration.is_active() {
            self.subscriptions.remove(&tid);
        }
        registration
    }

    /// 按订阅者身份撤销通道 `cid` 上的远程订阅。
    pub(crate) fn unsubscribe(&self, cid: u64, subscriber: &LocalSubscriber) -> bool {
        let tid = self
            .subscriptions
            .iter()
            .find(|entry| entry.cid == cid && entry.subscriber.same_as(subscriber))
            .map(|entry| *entry.key());
        match tid.and_then(|tid| self.subscriptions.remove(&tid)) {
            Some((tid, _)) => {
                self.send_unsubscribe(cid, tid);
                true
            }
            None => false,
        }
    }

    /// 通道 `cid` 上某种订阅的数量；`op` 为空时统计全部。
    pub(crate) fn subscription_count(&self, cid: u64, op: Option<Op>) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| entry.cid == cid && op.is_none_or(|op| entry.subscriber.op() == op))
            .count()
    }

    /// 结束通道 `cid` 上的全部远程订阅。
    pub(crate) fn end_channel(&self, cid: u64) {
        let tids: Vec<u64> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.cid == cid)
            .map(|entry| *entry.key())
            .collect();
        for tid in tids {
            if let Some((_, subscription)) = self.subscriptions.remove(&tid) {
                self.send_unsubscribe(cid, tid);
                subscription.subscriber.end();
            }
        }
    }

    fn send_subscription(&self, link: &Link, tid: u64) -> bool {
        let Some(mut subscription) = self.subscriptions.get_mut(&tid) else {
            return false;
        };
        if subscription.sent_on == Some(link.generation) {
            return true;
        }
        subscription.sent_on = Some(link.generation);
        link.send(&self.cids, subscription.cid, subscription.request.clone())
    }

    /// 退订请求不等待回复。
    fn send_unsubscribe(&self, cid: u64, target: u64) {
        let link = self.link.lock().clone();
        if let Some(link) = link {
            let request = protocol::request(self.next_tid(), Op::Unsubscribe).with(TARGET, target);
            link.send(&self.cids, cid, request);
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut index = 0;
        let mut failures = 0;
        while !self.shutdown.is_cancelled() {
            let endpoint = self.endpoints[index].clone();
            match self.establish(&endpoint).await {
                Ok((link, reader, writer)) => {
                    failures = 0;
                    self.run_link(link, reader, writer).await;
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        name = %self.name,
                        %endpoint,
                        code = err.code(),
                        error = %err,
                        "remote endpoint unavailable"
                    );
                }
            }
            index = (index + 1) % self.endpoints.len();
            if failures >= self.endpoints.len() {
                failures = 0;
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.options.retry_delay) => {}
                }
            }
        }
        debug!(name = %self.name, "remote access supervisor stopped");
    }

    async fn establish(&self, endpoint: &str) -> Result<(Arc<Link>, FrameReader, FrameWriter)> {
        let stream = connect_stream(endpoint, self.options.connect_timeout).await?;
        let (reader, mut writer) = frame(stream, self.session.wire_type);
        writer.send(self.session.header_document()).await?;
        let events = SocketEvents::new(self.shutdown.child_token());
        let waker: Arc<dyn WriteWaker> = events.clone();
        let link = Arc::new(Link {
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            endpoint: endpoint.to_owned(),
            outbound: WireOutPublisher::new(Some(waker)),
            events,
            opened: Mutex::new(HashSet::new()),
        });
        Ok((link, reader, writer))
    }

    async fn run_link(&self, link: Arc<Link>, mut reader: FrameReader, mut writer: FrameWriter) {
        {
            let mut current = self.link.lock();
            *current = Some(link.clone());
            self.link_changed.notify_all();
        }
        info!(name = %self.name, endpoint = %link.endpoint, "remote connection established");
        if let Some(monitor) = &self.monitor {
            monitor.on_connected(&self.name, &link.endpoint);
        }
        self.resubscribe(&link);

        let mut out = WireOut::default();
        let result: Result<()> = loop {
            if let Err(err) = write_queued(&link.outbound, &mut writer, &mut out).await {
                break Err(err);
            }
            tokio::select! {
                _ = link.events.cancel_token().cancelled() => break Ok(()),
                _ = link.events.woken() => {}
                frame = reader.next() => match frame {
                    Some(Ok(document)) if document.is_meta_data() => {}
                    Some(Ok(document)) => {
                        if let Err(err) = self.dispatch(&document) {
                            break Err(err.into());
                        }
                    }
                    Some(Err(err)) => break Err(err),
                    None => break Ok(()),
                }
            }
        };

        {
            let mut current = self.link.lock();
            if current.as_ref().is_some_and(|current| Arc::ptr_eq(current, &link)) {
                *current = None;
            }
        }
        link.outbound.close();
        link.events.close();
        self.pending.clear();
        match &result {
            Ok(()) => info!(name = %self.name, endpoint = %link.endpoint, "remote connection lost"),
            Err(err) if err.is_disconnect() => info!(
                name = %self.name,
                endpoint = %link.endpoint,
                error = %err,
                "remote connection lost"
            ),
            Err(err) => warn!(
                name = %self.name,
                endpoint = %link.endpoint,
                code = err.code(),
                error = %err,
                "remote connection failed"
            ),
        }
        if let Some(monitor) = &self.monitor {
            monitor.on_disconnected(&self.name, &link.endpoint);
        }
    }

    fn resubscribe(&self, link: &Link) {
        let tids: Vec<u64> = self.subscriptions.iter().map(|entry| *entry.key()).collect();
        let mut resent = 0;
        for tid in tids {
            // 从未发送过的订阅属于仍在等待回复的 `subscribe` 调用，由调用方自己发送。
            if let Some(mut subscription) = self.subscriptions.get_mut(&tid)
                && subscription
                    .sent_on
                    .is_some_and(|generation| generation != link.generation)
            {
                subscription.sent_on = Some(link.generation);
                if link.send(&self.cids, subscription.cid, subscription.request.clone()) {
                    resent += 1;
                }
            }
        }
        if resent > 0 {
            info!(name = %self.name, endpoint = %link.endpoint, resent, "remote subscriptions re-registered");
        }
    }

    fn dispatch(&self, document: &Document) -> spark_engine::Result<()> {
        match Inbound::parse(document)? {
            Inbound::Event { tid, payload } => {
                let subscriber = self
                    .subscriptions
                    .get(&tid)
                    .map(|entry| (entry.cid, entry.subscriber.clone()));
                match subscriber {
                    Some((cid, subscriber)) => {
                        if !subscriber.deliver(tid, &payload) {
                            self.subscriptions.remove(&tid);
                            self.send_unsubscribe(cid, tid);
                        }
                    }
                    None => debug!(tid, "event for an unknown remote subscription ignored"),
                }
            }
            Inbound::End { tid } => {
                if let Some((_, subscription)) = self.subscriptions.remove(&tid) {
                    debug!(tid, "remote subscription ended by the server");
                    subscription.subscriber.end();
                }
            }
            reply => {
                if let Some((_, waiter)) = self.pending.remove(&reply.tid()) {
                    let _ = waiter.try_send(reply);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl Drop for RemoteConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
