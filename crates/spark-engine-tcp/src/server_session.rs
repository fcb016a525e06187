//! # 远程会话服务端
//!
//! ## 核心意图（Why）
//! - 远程客户端通过会话连接访问服务端资产树上的映射、订阅与主题发布者；
//! - 每条会话连接维护自己的通道表与订阅表，连接断开即撤销该会话的全部订阅。
//!
//! ## 契约（What）
//! - 通道头登记或切换当前通道，数据文档作用于当前通道；
//! - 每个请求恰好得到一条回复（成功或错误），订阅事件与回复共用请求的 `tid`；
//! - 请求失败只影响该请求，协议违例（无通道头的数据、未知通道、重复 `tid`）拆除连接。

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use spark_engine::map::TopicMessage;
use spark_engine::server::ConnectionEvents;
use spark_engine::wire::{FieldReader, Value, WireOut, WireOutPublisher, WriteWaker};
use spark_engine::{
    Asset, Capability, Document, EngineError, InvalidSubscriber, MapEvent, ObjectSubscription,
    RequestContext, Result as EngineResult, SessionDetails, Subscriber,
};
use tracing::{debug, info, warn};

use crate::driver::{FrameReader, FrameWriter, SocketEvents, write_queued};
use crate::error::Result;
use crate::protocol::{
    self, BOOTSTRAP, ChannelTarget, FILTER, FILTER_TYPE, KEY, OP, Op, TARGET, TID, TOPIC, VALUE,
};

/// 未声明类型的过滤表达式按此值类型编译。
const DEFAULT_FILTER_TYPE: &str = "value";

/// 把订阅事件转发到会话连接的订阅者。
struct RemoteSink {
    cid: u64,
    tid: u64,
    outbound: Arc<WireOutPublisher>,
}

impl<E: Serialize> Subscriber<E> for RemoteSink {
    fn on_message(&self, event: &E) -> std::result::Result<(), InvalidSubscriber> {
        let payload = serde_json::to_value(event).map_err(|err| {
            warn!(tid = self.tid, error = %err, "subscription event is not serializable");
            InvalidSubscriber
        })?;
        let published = self.outbound.publish_all([
            Document::channel_header(self.cid),
            protocol::event(self.tid, payload),
        ]);
        if published { Ok(()) } else { Err(InvalidSubscriber) }
    }

    fn on_end_of_subscription(&self) {
        self.outbound
            .publish_all([Document::channel_header(self.cid), protocol::end(self.tid)]);
    }
}

/// 会话上仍然有效的一个订阅。
enum ActiveSubscription {
    Keys {
        subscription: Arc<dyn ObjectSubscription>,
        subscriber: Arc<dyn Subscriber<String>>,
    },
    Entries {
        subscription: Arc<dyn ObjectSubscription>,
        subscriber: Arc<dyn Subscriber<MapEvent>>,
    },
    Topics {
        subscription: Arc<dyn ObjectSubscription>,
        subscriber: Arc<dyn Subscriber<TopicMessage>>,
    },
}

impl ActiveSubscription {
    fn cancel(&self) -> bool {
        match self {
            ActiveSubscription::Keys {
                subscription,
                subscriber,
            } => subscription.unregister_key_subscriber(subscriber),
            ActiveSubscription::Entries {
                subscription,
                subscriber,
            } => subscription.unregister_entry_subscriber(subscriber),
            ActiveSubscription::Topics {
                subscription,
                subscriber,
            } => subscription.unregister_topic_subscriber(subscriber),
        }
    }
}

/// 一条会话连接的请求执行器。
///
/// # 教案式说明
/// - **契约 (What)**：`on_document` 同步执行，回复写入出站队列；
///   订阅的引导事件在回复之前入队，客户端需在发送订阅请求前登记 `tid`；
/// - **风险 (Trade-offs)**：请求在连接任务上执行，远端发起的大映射 `entries` 会短暂占用该任务。
pub(crate) struct SessionService {
    root: Arc<Asset>,
    session: SessionDetails,
    outbound: Arc<WireOutPublisher>,
    channels: HashMap<u64, ChannelTarget>,
    current: Option<u64>,
    subscriptions: HashMap<u64, ActiveSubscription>,
}

impl SessionService {
    pub(crate) fn new(
        root: Arc<Asset>,
        session: SessionDetails,
        outbound: Arc<WireOutPublisher>,
    ) -> Self {
        Self {
            root,
            session,
            outbound,
            channels: HashMap::new(),
            current: None,
            subscriptions: HashMap::new(),
        }
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn on_document(&mut self, document: &Document) -> EngineResult<()> {
        if document.is_meta_data() {
            return self.on_header(document);
        }
        let cid = self.current.ok_or_else(|| EngineError::ProtocolViolation {
            detail: "data document before any channel header".to_owned(),
        })?;
        let target = self
            .channels
            .get(&cid)
            .cloned()
            .ok_or_else(|| EngineError::ProtocolViolation {
                detail: format!("channel {cid} was never opened"),
            })?;
        let tid = document.read_u64(TID)?;
        let reply = match self.execute(cid, &target, tid, document) {
            Ok(value) => protocol::reply(tid, value),
            Err(err @ EngineError::ProtocolViolation { .. }) => return Err(err),
            Err(err) => {
                debug!(
                    user = %self.session.user_id,
                    csp = %target.csp,
                    tid,
                    code = err.code(),
                    "remote request failed"
                );
                protocol::error_reply(tid, &err)
            }
        };
        self.outbound
            .publish_all([Document::channel_header(cid), reply]);
        Ok(())
    }

    fn on_header(&mut self, header: &Document) -> EngineResult<()> {
        let cid = header.cid().ok_or_else(|| EngineError::ProtocolViolation {
            detail: "channel header without cid".to_owned(),
        })?;
        if cid == 0 {
            return Err(EngineError::ProtocolViolation {
                detail: "channel 0 is reserved for the session header".to_owned(),
            });
        }
        match ChannelTarget::from_header(header)? {
            Some(target) => {
                debug!(cid, csp = %target.csp, capability = %target.capability, "session channel opened");
                self.channels.insert(cid, target);
            }
            None if self.channels.contains_key(&cid) => {}
            None => {
                return Err(EngineError::ProtocolViolation {
                    detail: format!("channel {cid} was never opened"),
                });
            }
        }
        self.current = Some(cid);
        Ok(())
    }

    fn execute(
        &mut self,
        cid: u64,
        target: &ChannelTarget,
        tid: u64,
        request: &Document,
    ) -> EngineResult<Value> {
        let name = request.read_text(OP)?;
        let op = Op::from_name(name).ok_or_else(|| EngineError::Wire {
            field: OP.to_owned(),
            detail: format!("unknown operation `{name}`"),
        })?;
        if op.capability() != target.capability {
            return Err(EngineError::ViewTypeMismatch {
                path: target.csp.clone(),
                expected: op.capability(),
            });
        }
        let asset = self.root.acquire_asset(&target.csp)?;
        let store = || asset.acquire_key_value_store();
        match op {
            Op::Get => Ok(protocol::optional(store()?.get(request.read_text(KEY)?)?)),
            Op::Put => {
                let value = request.read_value(VALUE)?.clone();
                Ok(protocol::optional(store()?.put(request.read_text(KEY)?, value)?))
            }
            Op::PutIfAbsent => {
                let value = request.read_value(VALUE)?.clone();
                Ok(protocol::optional(
                    store()?.put_if_absent(request.read_text(KEY)?, value)?,
                ))
            }
            Op::Remove => Ok(protocol::optional(store()?.remove(request.read_text(KEY)?)?)),
            Op::ContainsKey => Ok(Value::Bool(store()?.contains_key(request.read_text(KEY)?)?)),
            Op::Len => Ok(json!(store()?.len()?)),
            Op::Keys => Ok(json!(store()?.keys()?)),
            Op::Entries => Ok(json!(store()?.entries()?)),
            Op::Clear => {
                store()?.clear()?;
                Ok(Value::Null)
            }
            Op::Publish => {
                let message = request.read_value(VALUE)?.clone();
                asset
                    .acquire_topic_publisher()?
                    .publish(request.read_text(TOPIC)?, message)?;
                Ok(Value::Null)
            }
            op if op.is_subscribe() => self.subscribe(cid, &asset, tid, op, request),
            _ => {
                let target_tid = request.read_u64(TARGET)?;
                Ok(Value::Bool(self.unsubscribe(target_tid)))
            }
        }
    }

    fn subscribe(
        &mut self,
        cid: u64,
        asset: &Arc<Asset>,
        tid: u64,
        op: Op,
        request: &Document,
    ) -> EngineResult<Value> {
        if self.subscriptions.contains_key(&tid) {
            return Err(EngineError::ProtocolViolation {
                detail: format!("tid {tid} already carries a subscription"),
            });
        }
        let subscription = asset.acquire_object_subscription()?;
        let bootstrap = request
            .field(BOOTSTRAP)
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let rc = RequestContext::for_view(asset.full_name(), Capability::ObjectSubscription)
            .with_bootstrap(bootstrap);
        let sink = Arc::new(RemoteSink {
            cid,
            tid,
            outbound: self.outbound.clone(),
        });

        let (registration, active) = match op {
            Op::SubscribeKeys => {
                let subscriber: Arc<dyn Subscriber<String>> = sink;
                let registration = subscription.register_key_subscriber(&rc, subscriber.clone());
                (
                    registration,
                    ActiveSubscription::Keys {
                        subscription,
                        subscriber,
                    },
                )
            }
            Op::SubscribeEntries => {
                let filter = match request.field(FILTER).and_then(Value::as_str) {
                    Some(expression) => {
                        let value_type = request
                            .field(FILTER_TYPE)
                            .and_then(Value::as_str)
                            .unwrap_or(DEFAULT_FILTER_TYPE);
                        Some(self.root.context().filters().compile(value_type, expression)?)
                    }
                    None => None,
                };
                let subscriber: Arc<dyn Subscriber<MapEvent>> = sink;
                let registration =
                    subscription.register_entry_subscriber(&rc, subscriber.clone(), filter);
                (
                    registration,
                    ActiveSubscription::Entries {
                        subscription,
                        subscriber,
                    },
                )
            }
            _ => {
                let subscriber: Arc<dyn Subscriber<TopicMessage>> = sink;
                let registration =
                    subscription.register_topic_subscriber(&rc, subscriber.clone());
                (
                    registration,
                    ActiveSubscription::Topics {
                        subscription,
                        subscriber,
                    },
                )
            }
        };
        if registration.is_active() {
            self.subscriptions.insert(tid, active);
        }
        debug!(
            user = %self.session.user_id,
            csp = %asset.full_name(),
            tid,
            op = op.as_str(),
            ?registration,
            "remote subscription registered"
        );
        Ok(Value::from(protocol::registration_name(registration)))
    }

    fn unsubscribe(&mut self, target_tid: u64) -> bool {
        self.subscriptions
            .remove(&target_tid)
            .is_some_and(|active| active.cancel())
    }

    /// 撤销会话的全部订阅。
    pub(crate) fn close(&mut self) {
        for (_, active) in self.subscriptions.drain() {
            active.cancel();
        }
        self.channels.clear();
        self.current = None;
    }
}

/// 服务一条已完成会话握手的远程客户端连接，直到任一方关闭。
pub(crate) async fn serve_session(
    root: Arc<Asset>,
    session: SessionDetails,
    events: Arc<SocketEvents>,
    mut reader: FrameReader,
    mut writer: FrameWriter,
    endpoint: String,
) -> Result<()> {
    let waker: Arc<dyn WriteWaker> = events.clone();
    let outbound = Arc::new(WireOutPublisher::new(Some(waker)));
    let mut service = SessionService::new(root, session.clone(), outbound.clone());
    let mut out = WireOut::default();
    let result = loop {
        if let Err(err) = write_queued(outbound.as_ref(), &mut writer, &mut out).await {
            break Err(err);
        }
        tokio::select! {
            _ = events.cancel_token().cancelled() => break Ok(()),
            _ = events.woken() => {}
            frame = reader.next() => match frame {
                Some(Ok(document)) => {
                    if let Err(err) = service.on_document(&document) {
                        break Err(err.into());
                    }
                }
                Some(Err(err)) => break Err(err),
                None => break Ok(()),
            }
        }
    };
    let subscriptions = service.subscription_count();
    service.close();
    outbound.close();
    events.close();
    match &result {
        Ok(()) => info!(
            user = %session.user_id,
            client = %session.client_id,
            %endpoint,
            subscriptions,
            "remote session closed"
        ),
        Err(err) => warn!(
            user = %session.user_id,
            %endpoint,
            code = err.code(),
            error = %err,
            "remote session failed"
        ),
    }
    result
}

#[cfg(test)]
mod tests {
    use spark_engine::wire::{CID, WireWriter};
    use spark_engine::{AssetTree, Subscription, WireType};

    use super::*;
    use crate::protocol::{Inbound, channel_open, request};

    struct Harness {
        tree: AssetTree,
        outbound: Arc<WireOutPublisher>,
        service: SessionService,
    }

    impl Harness {
        fn new() -> Self {
            let tree = AssetTree::new().for_testing().expect("测试树");
            let outbound = Arc::new(WireOutPublisher::new(None));
            let service = SessionService::new(
                tree.root().clone(),
                SessionDetails::for_user("alice", WireType::Json),
                outbound.clone(),
            );
            Self {
                tree,
                outbound,
                service,
            }
        }

        fn send(&mut self, documents: &[Document]) {
            for document in documents {
                self.service.on_document(document).expect("合法请求");
            }
        }

        fn replies(&self) -> Vec<(u64, Inbound)> {
            let mut out = WireOut::new(1024);
            self.outbound.write_to(&mut out);
            let mut cid = None;
            let mut replies = Vec::new();
            for document in out.drain() {
                if document.is_meta_data() {
                    cid = document.cid();
                } else {
                    replies.push((
                        cid.expect("数据前有通道头"),
                        Inbound::parse(&document).expect("合法回复"),
                    ));
                }
            }
            replies
        }
    }

    #[test]
    fn map_requests_round_trip_through_one_channel() {
        let mut harness = Harness::new();
        let target = ChannelTarget::new("/prices/fx", Capability::KeyValueStore);
        harness.send(&[
            channel_open(1, &target),
            request(10, Op::Put).with(KEY, "EURUSD").with(VALUE, 1.08),
            Document::channel_header(1),
            request(11, Op::Get).with(KEY, "EURUSD"),
            request(12, Op::Get).with(KEY, "GBPUSD"),
            request(13, Op::Len),
        ]);

        let replies = harness.replies();
        assert_eq!(replies.len(), 4);
        assert!(replies.iter().all(|(cid, _)| *cid == 1));
        let values: Vec<Value> = replies
            .into_iter()
            .map(|(_, inbound)| inbound.into_reply().expect("成功回复"))
            .collect();
        assert_eq!(protocol::read_optional(&values[0]), None);
        assert_eq!(protocol::read_optional(&values[1]), Some(json!(1.08)));
        assert_eq!(protocol::read_optional(&values[2]), None);
        assert_eq!(values[3], json!(1));

        let local = harness.tree.acquire_map("/prices/fx").expect("本地映射");
        assert_eq!(local.get("EURUSD").expect("读取"), Some(json!(1.08)));
    }

    #[test]
    fn failures_are_replied_and_violations_are_fatal() {
        let mut harness = Harness::new();
        let err = harness
            .service
            .on_document(&request(1, Op::Get).with(KEY, "x"))
            .expect_err("没有通道头的数据");
        assert_eq!(err.code(), "engine.protocol.violation");

        let err = harness
            .service
            .on_document(&Document::meta().with(CID, 7))
            .expect_err("未登记的通道");
        assert_eq!(err.code(), "engine.protocol.violation");

        let target = ChannelTarget::new("/prices", Capability::TopicPublisher);
        harness.send(&[
            channel_open(2, &target),
            request(3, Op::Get).with(KEY, "x"),
            request(4, Op::Publish).with(TOPIC, "EURUSD").with(VALUE, 1.1),
        ]);
        let replies = harness.replies();
        assert!(matches!(
            &replies[0].1,
            Inbound::Failure { code, .. } if code == "engine.view.type_mismatch"
        ));
        assert_eq!(replies[1].1, Inbound::Reply { tid: 4, value: Value::Null });
        let published = harness
            .tree
            .acquire_map("/prices")
            .expect("映射")
            .get("EURUSD")
            .expect("读取");
        assert_eq!(published, Some(json!(1.1)));
    }

    #[test]
    fn subscriptions_bootstrap_before_the_reply_and_end_with_the_session() {
        let mut harness = Harness::new();
        let map = harness.tree.acquire_map("/orders").expect("映射");
        map.put("o-1", json!({"qty": 5})).expect("写入");
        map.put("o-2", json!({"qty": 50})).expect("写入");

        let target = ChannelTarget::new("/orders", Capability::ObjectSubscription);
        harness.send(&[
            channel_open(3, &target),
            request(20, Op::SubscribeEntries)
                .with(FILTER, "qty > 10")
                .with(FILTER_TYPE, "order"),
        ]);
        let replies = harness.replies();
        assert_eq!(replies.len(), 2, "一个引导事件与一条回复");
        assert!(matches!(
            &replies[0].1,
            Inbound::Event { tid: 20, payload } if payload["key"] == "o-2"
        ));
        assert_eq!(
            replies[1].1,
            Inbound::Reply {
                tid: 20,
                value: json!("added")
            }
        );
        assert_eq!(harness.service.subscription_count(), 1);

        map.put("o-3", json!({"qty": 99})).expect("写入");
        let replies = harness.replies();
        assert!(matches!(
            &replies[0].1,
            Inbound::Event { payload, .. } if payload["type"] == "inserted" && payload["key"] == "o-3"
        ));

        harness.send(&[request(21, Op::Unsubscribe).with(TARGET, 20)]);
        assert_eq!(
            harness.replies()[0].1,
            Inbound::Reply {
                tid: 21,
                value: Value::Bool(true)
            }
        );
        assert_eq!(
            harness
                .tree
                .acquire_subscription("/orders")
                .expect("订阅")
                .entry_subscriber_count(),
            0
        );
    }

    #[test]
    fn closing_the_session_unregisters_everything() {
        let mut harness = Harness::new();
        let target = ChannelTarget::new("/quotes", Capability::ObjectSubscription);
        harness.send(&[
            channel_open(1, &target),
            request(1, Op::SubscribeKeys),
            request(2, Op::SubscribeTopics).with(BOOTSTRAP, false),
        ]);
        let subscription = harness.tree.acquire_subscription("/quotes").expect("订阅");
        assert_eq!(subscription.subscriber_count(), 2);

        harness.service.close();
        assert_eq!(subscription.subscriber_count(), 0);
        assert_eq!(harness.service.subscription_count(), 0);
    }
}
