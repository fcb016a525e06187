//! 集群连接处理器的握手、准入、终止、心跳与写者轮转。
//!
//! # 教案式说明
//! - **Why**：连接协议的每条分支都会影响对端行为（是否收到终止消息、何时断开），必须逐条固定；
//! - **How**：两个处理器在内存中直接交换文档，`RecordingEvents` 记录唤醒与拆除请求；
//!   涉及宽限期与心跳的用例使用暂停时钟；
//! - **What**：覆盖拒绝路径、终止回调、断开通知恰好一次、集群缺失、身份不符、协议违例与轮转性质。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use spark_engine::cluster::{
    ClusterTiming, ConnectionChangedNotifier, EngineCluster, FnStrategy, HostId, RejectAllStrategy,
};
use spark_engine::server::{
    ClusterConnectionHandler, ConnectionEvents, ConnectionState, HEARTBEAT_TYPE, InitOutcome,
    LOCAL_IDENTIFIER, NetworkContext, REMOTE_IDENTIFIER, TERMINATOR_TYPE,
};
use spark_engine::wire::{
    DEFAULT_OUT_CAPACITY, Document, FieldReader, HANDLER, HANDLER_TYPE, WireOut, WireType,
    WireWriter, WriteWaker,
};
use spark_engine::{AssetTree, EngineError, ErrorKind};
use tracing_test::traced_test;

#[derive(Default)]
struct RecordingEvents {
    wakes: AtomicUsize,
    closes: AtomicUsize,
}

impl WriteWaker for RecordingEvents {
    fn wake(&self) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }
}

impl ConnectionEvents for RecordingEvents {
    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ChangeLog {
    changes: Mutex<Vec<bool>>,
}

impl ChangeLog {
    fn changes(&self) -> Vec<bool> {
        self.changes.lock().clone()
    }
}

impl ConnectionChangedNotifier for ChangeLog {
    fn on_connection_changed(&self, connected: bool, _: &NetworkContext) {
        self.changes.lock().push(connected);
    }
}

fn host(host_id: HostId, cluster: EngineCluster) -> AssetTree {
    let tree = AssetTree::with_host_id(host_id)
        .for_testing()
        .expect("测试装配");
    tree.clusters().expect("测试装配包含 Clusters").insert(cluster);
    tree
}

fn network(tree: &AssetTree, acceptor: bool) -> (Arc<NetworkContext>, Arc<RecordingEvents>) {
    let events = Arc::new(RecordingEvents::default());
    let context = NetworkContext::new(tree.root().clone(), acceptor, events.clone());
    (Arc::new(context), events)
}

fn drain(handler: &ClusterConnectionHandler) -> Vec<Document> {
    let mut documents = Vec::new();
    loop {
        let mut out = WireOut::new(DEFAULT_OUT_CAPACITY);
        handler.on_write(&mut out);
        if out.is_empty() {
            return documents;
        }
        documents.extend(out.drain());
    }
}

fn deliver(documents: Vec<Document>, to: &Arc<ClusterConnectionHandler>) {
    let mut out = WireOut::new(DEFAULT_OUT_CAPACITY);
    for document in documents {
        to.on_read(&document, &mut out).expect("对端文档应合法");
    }
}

fn handler_type(document: &Document) -> Option<String> {
    document
        .read_object(HANDLER)
        .ok()
        .and_then(|descriptor| descriptor.read_text(HANDLER_TYPE).ok().map(str::to_owned))
}

struct Pair {
    connector: Arc<ClusterConnectionHandler>,
    acceptor: Arc<ClusterConnectionHandler>,
    connector_outcome: InitOutcome,
    acceptor_outcome: InitOutcome,
    acceptor_events: Arc<RecordingEvents>,
}

/// 连接方 `remote` -> 接受方 `local`：先发握手，再各自初始化。
fn connect(connector_tree: &AssetTree, acceptor_tree: &AssetTree) -> Pair {
    let connector_id = connector_tree.host_id().expect("连接方主机标识");
    let acceptor_id = acceptor_tree.host_id().expect("接受方主机标识");
    let connector = ClusterConnectionHandler::new(connector_id, acceptor_id, "blue", WireType::Json);
    let handshake = connector.handshake_document();
    let (connector_net, _) = network(connector_tree, false);
    let connector_outcome = connector.on_initialize(connector_net).expect("连接方初始化");

    let descriptor = handshake.read_object(HANDLER).expect("握手携带描述");
    let acceptor = ClusterConnectionHandler::from_descriptor(descriptor).expect("合法握手");
    let (acceptor_net, acceptor_events) = network(acceptor_tree, true);
    let acceptor_outcome = acceptor.on_initialize(acceptor_net).expect("接受方初始化");
    Pair {
        connector,
        acceptor,
        connector_outcome,
        acceptor_outcome,
        acceptor_events,
    }
}

#[tokio::test(start_paused = true)]
async fn rejected_peer_receives_one_termination_then_connection_closes_after_grace() {
    let cluster = EngineCluster::new("blue");
    cluster.install_connection_strategy(2, Arc::new(RejectAllStrategy));
    let changes = Arc::new(ChangeLog::default());
    cluster.install_connection_notifier(2, changes.clone());
    let acceptor_tree = host(1, cluster);
    let connector_tree = host(2, EngineCluster::new("blue"));

    let pair = connect(&connector_tree, &acceptor_tree);
    assert_eq!(pair.acceptor_outcome, InitOutcome::Rejected);
    assert_eq!(pair.acceptor.state(), ConnectionState::Terminating);

    let sent = drain(&pair.acceptor);
    assert_eq!(
        handler_type(&sent[0]).as_deref(),
        Some("cluster"),
        "接受方在任何其他消息之前回显握手"
    );
    let terminations: Vec<_> = sent
        .iter()
        .filter(|doc| handler_type(doc).as_deref() == Some(TERMINATOR_TYPE))
        .collect();
    assert_eq!(terminations.len(), 1);
    let addressed = terminations[0].read_object(HANDLER).expect("终止描述");
    assert_eq!(addressed.read_i32(LOCAL_IDENTIFIER).expect("local"), 1);
    assert_eq!(addressed.read_i32(REMOTE_IDENTIFIER).expect("remote"), 2);

    tokio::time::sleep(Duration::from_millis(1_999)).await;
    assert!(!pair.acceptor.is_closed(), "宽限期内保持连接，让终止消息写出");
    tokio::time::sleep(Duration::from_millis(2)).await;
    assert!(pair.acceptor.is_closed());
    assert_eq!(pair.acceptor_events.closes.load(Ordering::SeqCst), 1);
    assert!(changes.changes().is_empty(), "被拒绝的对端从未被通知为已连接");

    acceptor_tree.close();
    connector_tree.close();
}

#[tokio::test(start_paused = true)]
async fn termination_message_invokes_handler_and_closes_peer() {
    let rejecting = EngineCluster::new("blue");
    rejecting.install_connection_strategy(2, Arc::new(FnStrategy::new(|_, remote| remote != 2)));
    let acceptor_tree = host(1, rejecting);

    let terminated = Arc::new(Mutex::new(Vec::new()));
    let connector_changes = Arc::new(ChangeLog::default());
    let connector_cluster = EngineCluster::new("blue");
    let sink = terminated.clone();
    connector_cluster.install_termination_handler(
        1,
        Arc::new(move |remote: HostId| sink.lock().push(remote)),
    );
    connector_cluster.install_connection_notifier(1, connector_changes.clone());
    let connector_tree = host(2, connector_cluster);

    let pair = connect(&connector_tree, &acceptor_tree);
    assert_eq!(pair.connector_outcome, InitOutcome::Established);
    assert_eq!(pair.acceptor_outcome, InitOutcome::Rejected);

    deliver(drain(&pair.acceptor), &pair.connector);
    assert_eq!(*terminated.lock(), vec![1]);
    assert!(pair.connector.is_closed());
    assert_eq!(connector_changes.changes(), vec![true, false]);

    acceptor_tree.close();
    connector_tree.close();
}

#[test]
fn concurrent_close_reports_disconnection_exactly_once() {
    let changes = Arc::new(ChangeLog::default());
    let cluster = EngineCluster::new("blue");
    cluster.install_connection_notifier(2, changes.clone());
    let acceptor_tree = host(1, cluster);
    let connector_tree = host(2, EngineCluster::new("blue"));

    let pair = connect(&connector_tree, &acceptor_tree);
    assert_eq!(pair.acceptor_outcome, InitOutcome::Established);
    deliver(drain(&pair.acceptor), &pair.connector);
    assert!(pair.acceptor.is_connected());

    let barrier = Arc::new(Barrier::new(4));
    let closers: Vec<_> = (0..4)
        .map(|_| {
            let handler = pair.acceptor.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                handler.close();
            })
        })
        .collect();
    for closer in closers {
        closer.join().expect("关闭线程不应 panic");
    }
    pair.acceptor.close();

    assert_eq!(changes.changes(), vec![true, false]);
    assert_eq!(pair.acceptor_events.closes.load(Ordering::SeqCst), 1);
    assert_eq!(pair.acceptor.state(), ConnectionState::Closed);

    acceptor_tree.close();
    connector_tree.close();
}

#[test]
#[traced_test]
fn unknown_cluster_aborts_without_sending_anything() {
    let acceptor_tree = host(1, EngineCluster::new("green"));
    let connector_tree = host(2, EngineCluster::new("green"));
    let pair = connect(&connector_tree, &acceptor_tree);

    assert_eq!(pair.acceptor_outcome, InitOutcome::Aborted);
    assert!(drain(&pair.acceptor).is_empty(), "中止的初始化不发送任何协议消息");
    assert!(!pair.acceptor.is_connected());
    assert!(logs_contain("cluster not found"));

    acceptor_tree.close();
    connector_tree.close();
}

#[test]
fn handshake_for_another_host_is_an_identity_mismatch() {
    let acceptor_tree = host(1, EngineCluster::new("blue"));
    let misdirected = ClusterConnectionHandler::new(2, 5, "blue", WireType::Binary);
    let descriptor = misdirected.descriptor();
    let acceptor = ClusterConnectionHandler::from_descriptor(&descriptor).expect("握手格式合法");
    let (net, events) = network(&acceptor_tree, true);

    let err = acceptor.on_initialize(net).expect_err("本机标识是 1");
    assert_eq!(err, EngineError::IdentityMismatch { local: 5, host: 1 });
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(acceptor.is_closed());
    assert_eq!(events.closes.load(Ordering::SeqCst), 1);
    acceptor_tree.close();
}

#[test]
fn data_before_any_header_is_a_protocol_violation() {
    let connector_tree = host(2, EngineCluster::new("blue"));
    let connector = ClusterConnectionHandler::new(2, 1, "blue", WireType::Binary);
    let (net, _) = network(&connector_tree, false);
    assert_eq!(
        connector.on_initialize(net.clone()).expect("初始化"),
        InitOutcome::Established
    );

    let mut out = WireOut::new(DEFAULT_OUT_CAPACITY);
    let err = connector
        .on_read(&Document::data().with("payload", 1), &mut out)
        .expect_err("没有通道头");
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);

    let again = connector.on_initialize(net).expect_err("重复初始化");
    assert_eq!(again.kind(), ErrorKind::ProtocolViolation);
    connector_tree.close();
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_peers_alive_and_silence_closes_them() {
    let timing = ClusterTiming {
        heartbeat_interval: Some(Duration::from_millis(100)),
        heartbeat_timeout: Duration::from_millis(350),
        ..ClusterTiming::default()
    };
    let acceptor_tree = host(1, EngineCluster::new("blue").with_timing(timing));
    let connector_tree = host(2, EngineCluster::new("blue").with_timing(timing));
    let pair = connect(&connector_tree, &acceptor_tree);
    assert_eq!(pair.connector_outcome, InitOutcome::Established);
    assert_eq!(pair.connector.sub_channel_count(), 1, "连接方打开心跳子通道");

    let opening = drain(&pair.connector);
    assert!(
        opening
            .iter()
            .any(|doc| handler_type(doc).as_deref() == Some(HEARTBEAT_TYPE))
    );
    deliver(opening, &pair.acceptor);
    deliver(drain(&pair.acceptor), &pair.connector);
    assert_eq!(pair.acceptor.sub_channel_count(), 1, "接受方按通道头建立心跳处理器");

    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        deliver(drain(&pair.connector), &pair.acceptor);
        deliver(drain(&pair.acceptor), &pair.connector);
    }
    assert!(!pair.connector.is_closed());
    assert!(!pair.acceptor.is_closed());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(pair.connector.is_closed(), "停止交换后心跳超时");
    assert!(pair.acceptor.is_closed());

    acceptor_tree.close();
    connector_tree.close();
}

struct CountingWriter {
    index: usize,
    visits: Arc<Mutex<Vec<usize>>>,
}

impl WireWriter for CountingWriter {
    fn write_to(&self, out: &mut WireOut) {
        self.visits.lock().push(self.index);
        out.push(Document::data().with("writer", self.index as u64));
    }
}

fn writers(handler: &ClusterConnectionHandler, count: usize) -> Arc<Mutex<Vec<usize>>> {
    let visits = Arc::new(Mutex::new(Vec::new()));
    for index in 0..count {
        handler.add_writer(Arc::new(CountingWriter {
            index,
            visits: visits.clone(),
        }));
    }
    visits
}

proptest! {
    #[test]
    fn round_robin_visits_each_writer_once_per_cycle(k in 1usize..6, m in 1usize..6, warmup in 0usize..10) {
        let handler = ClusterConnectionHandler::new(1, 2, "blue", WireType::Binary);
        let visits = writers(&handler, k);
        let mut out = WireOut::new(DEFAULT_OUT_CAPACITY);
        for _ in 0..warmup {
            handler.on_write(&mut out);
            out.clear();
        }
        visits.lock().clear();

        for _ in 0..k * m {
            handler.on_write(&mut out);
            prop_assert_eq!(out.len(), 1, "每次只询问一个写者");
            out.clear();
        }
        let visits = visits.lock().clone();
        for index in 0..k {
            prop_assert_eq!(visits.iter().filter(|&&v| v == index).count(), m);
        }
        prop_assert_eq!(visits[0], warmup % k, "从上一次停下的位置继续");
        for pair in visits.windows(2) {
            prop_assert_eq!(pair[1], (pair[0] + 1) % k);
        }
    }
}

#[test]
fn concurrent_writes_share_the_cursor_evenly() {
    const THREADS: usize = 4;
    const CALLS: usize = 250;
    const WRITERS: usize = 3;

    let handler = ClusterConnectionHandler::new(1, 2, "blue", WireType::Binary);
    let visits = writers(&handler, WRITERS);
    let start = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let handler = handler.clone();
            let start = start.clone();
            thread::spawn(move || {
                let mut out = WireOut::new(DEFAULT_OUT_CAPACITY);
                start.wait();
                for _ in 0..CALLS {
                    handler.on_write(&mut out);
                    out.clear();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("写线程正常结束");
    }

    let visits = visits.lock().clone();
    assert_eq!(visits.len(), THREADS * CALLS);
    let expected = THREADS * CALLS / WRITERS;
    for index in 0..WRITERS {
        let count = visits.iter().filter(|&&v| v == index).count();
        assert!(
            count.abs_diff(expected) <= 1,
            "写者 {index} 被询问 {count} 次，期望约 {expected} 次"
        );
    }
}

#[test]
fn cursor_survives_writers_being_removed() {
    let handler = ClusterConnectionHandler::new(1, 2, "blue", WireType::Binary);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let added: Vec<Arc<dyn WireWriter>> = (0..4)
        .map(|index| {
            Arc::new(CountingWriter {
                index,
                visits: visits.clone(),
            }) as Arc<dyn WireWriter>
        })
        .collect();
    for writer in &added {
        handler.add_writer(writer.clone());
    }
    let mut out = WireOut::new(DEFAULT_OUT_CAPACITY);
    for _ in 0..3 {
        handler.on_write(&mut out);
        out.clear();
    }
    assert!(handler.remove_writer(&added[3]));
    assert!(handler.remove_writer(&added[2]));
    assert!(!handler.remove_writer(&added[2]));
    for _ in 0..4 {
        handler.on_write(&mut out);
        assert_eq!(out.len(), 1);
        out.clear();
    }
    assert!(visits.lock().iter().skip(3).all(|&index| index < 2));
}
