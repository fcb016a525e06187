//! 远程访问客户端：请求往返、远程订阅与按顺序故障转移。
//!
//! # 教案式说明
//! - **Why**：远程视图必须与本地视图表现一致，订阅在换到下一个端点后继续收到事件；
//! - **How**：服务端树运行在测试自有的 Tokio 运行时上，客户端树在普通线程里以同步方式调用远程视图；
//!   订阅者把事件送进标准库通道，监视器记录连接变化；
//! - **What**：覆盖读写往返、主题发布、引导与过滤后的条目事件、无可用端点时的请求超时，
//!   以及关闭首个服务端后切换到第二个服务端并恢复订阅。

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use spark_engine::{
    AssetTree, ClientConnectionMonitor, FnSubscriber, InvalidSubscriber, MapEvent, Registration,
    SessionDetails, Subscriber, Subscription, WireType,
};
use spark_engine_tcp::{EngineServer, RemoteAccessExt, RemoteOptions, ServerHandle};
use tokio::runtime::Runtime;

const WAIT: Duration = Duration::from_secs(5);

struct Server {
    tree: AssetTree,
    handle: ServerHandle,
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("构建测试运行时")
}

fn start_server(runtime: &Runtime) -> Server {
    let tree = AssetTree::new().for_testing().expect("测试装配");
    let server = runtime
        .block_on(EngineServer::bind(&tree, "127.0.0.1:0"))
        .expect("绑定本地端口");
    let handle = server.spawn(runtime.handle());
    Server { tree, handle }
}

fn client() -> AssetTree {
    AssetTree::new().for_testing().expect("测试装配")
}

fn session(wire_type: WireType) -> SessionDetails {
    SessionDetails::for_user("tester", wire_type)
}

fn entry_events() -> (Arc<dyn Subscriber<MapEvent>>, Receiver<MapEvent>) {
    let (tx, rx) = channel();
    let tx = Mutex::new(tx);
    let subscriber: Arc<dyn Subscriber<MapEvent>> = Arc::new(FnSubscriber::new(
        move |event: &MapEvent| -> Result<(), InvalidSubscriber> {
            tx.lock().send(event.clone()).map_err(|_| InvalidSubscriber)
        },
    ));
    (subscriber, rx)
}

#[derive(Default)]
struct Transitions {
    sink: Mutex<Option<Sender<(bool, String)>>>,
}

impl Transitions {
    fn watch(&self) -> Receiver<(bool, String)> {
        let (tx, rx) = channel();
        *self.sink.lock() = Some(tx);
        rx
    }

    fn record(&self, connected: bool, endpoint: &str) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send((connected, endpoint.to_owned()));
        }
    }
}

impl ClientConnectionMonitor for Transitions {
    fn on_connected(&self, _: &str, endpoint: &str) {
        self.record(true, endpoint);
    }

    fn on_disconnected(&self, _: &str, endpoint: &str) {
        self.record(false, endpoint);
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn map_operations_round_trip_through_the_server() {
    let runtime = runtime();
    let server = start_server(&runtime);
    let endpoint = server.handle.endpoint();
    let client = client();
    let connection = client
        .for_remote_access(&[endpoint.as_str()], WireType::Binary, session(WireType::Binary), None)
        .expect("装配远程访问");

    let prices = client.acquire_map("/prices").expect("远程规则提供映射");
    assert_eq!(prices.kind(), "remote");
    assert_eq!(prices.put("eur", json!(1.1)).expect("写入"), None);
    assert_eq!(prices.put("eur", json!(1.2)).expect("覆盖"), Some(json!(1.1)));
    assert_eq!(prices.put_if_absent("eur", json!(9)).expect("条件写入"), Some(json!(1.2)));
    assert_eq!(prices.get("eur").expect("读取"), Some(json!(1.2)));
    assert_eq!(prices.get("gbp").expect("读取缺失键"), None);
    assert!(prices.contains_key("eur").expect("查询键"));
    assert_eq!(prices.len().expect("长度"), 1);

    let local = server.tree.acquire_map("/prices").expect("服务端映射");
    assert_eq!(local.get("eur").expect("服务端读取"), Some(json!(1.2)));

    let news = client.acquire_topic_publisher("/news").expect("远程规则提供主题发布者");
    news.publish("fx", json!("up")).expect("发布主题");
    let news_map = server.tree.acquire_map("/news").expect("服务端映射");
    assert_eq!(news_map.get("fx").expect("服务端读取"), Some(json!("up")));

    assert_eq!(prices.remove("eur").expect("删除"), Some(json!(1.2)));
    assert_eq!(prices.keys().expect("键列表"), Vec::<String>::new());

    connection.close();
    client.close();
    server.handle.shutdown();
    runtime.block_on(server.handle.join()).expect("服务端正常停止");
}

#[test]
fn entry_subscription_bootstraps_and_filters_remotely() {
    let runtime = runtime();
    let server = start_server(&runtime);
    let orders = server.tree.acquire_map("/orders").expect("服务端映射");
    orders.put("o-1", json!({"qty": 5})).expect("写入初值");

    let endpoint = server.handle.endpoint();
    let client = client();
    let connection = client
        .for_remote_access(&[endpoint.as_str()], WireType::Json, session(WireType::Json), None)
        .expect("装配远程访问");

    let (all, all_events) = entry_events();
    assert_eq!(
        client
            .register_entry_subscriber("/orders", all.clone(), None)
            .expect("注册"),
        Registration::Added
    );
    match all_events.recv_timeout(WAIT).expect("引导事件") {
        MapEvent::Inserted { key, value, .. } => {
            assert_eq!(key, "o-1");
            assert_eq!(value, json!({"qty": 5}));
        }
        other => panic!("引导应为插入事件，实际为 {other:?}"),
    }
    assert_eq!(
        client
            .register_entry_subscriber("/orders", all.clone(), None)
            .expect("注册"),
        Registration::AlreadyPresent
    );

    let filter = client.compile_filter("value", "qty > 10").expect("编译过滤器");
    let (large, large_events) = entry_events();
    client
        .register_entry_subscriber("/orders?bootstrap=false", large, Some(filter))
        .expect("注册");

    orders.put("o-1", json!({"qty": 50})).expect("服务端更新");
    match all_events.recv_timeout(WAIT).expect("更新事件") {
        MapEvent::Updated { old_value, value, .. } => {
            assert_eq!(old_value, json!({"qty": 5}));
            assert_eq!(value, json!({"qty": 50}));
        }
        other => panic!("应为更新事件，实际为 {other:?}"),
    }
    assert!(matches!(
        large_events.recv_timeout(WAIT).expect("过滤后的更新"),
        MapEvent::Updated { .. }
    ));
    orders.put("o-2", json!({"qty": 1})).expect("服务端写入小单");
    assert!(all_events.recv_timeout(WAIT).is_ok());
    assert!(
        large_events.recv_timeout(Duration::from_millis(200)).is_err(),
        "不满足过滤条件的事件不下发"
    );

    let subscription = client.acquire_subscription("/orders").expect("远程订阅");
    assert_eq!(subscription.entry_subscriber_count(), 2);
    assert!(subscription.unregister_entry_subscriber(&all));
    assert_eq!(subscription.entry_subscriber_count(), 1);

    connection.close();
    client.close();
    server.handle.shutdown();
    runtime.block_on(server.handle.join()).expect("服务端正常停止");
}

#[test]
fn requests_time_out_when_no_endpoint_is_reachable() {
    let client = client();
    let connection = client
        .for_remote_access_with(
            &["127.0.0.1:1"],
            WireType::Binary,
            session(WireType::Binary),
            None,
            RemoteOptions::new()
                .with_request_timeout(Duration::from_millis(300))
                .with_retry_delay(Duration::from_millis(50)),
        )
        .expect("装配远程访问");

    let prices = client.acquire_map("/prices").expect("远程规则提供映射");
    let err = prices.get("eur").expect_err("没有可用端点");
    assert_eq!(err.code(), "engine.transport");
    assert!(err.to_string().contains("request_timeout"), "{err}");
    assert!(!connection.is_connected());

    connection.close();
    client.close();
}

#[test]
fn subscriptions_follow_the_connection_to_the_next_endpoint() {
    let runtime = runtime();
    let first = start_server(&runtime);
    let second = start_server(&runtime);
    let first_endpoint = first.handle.endpoint();
    let second_endpoint = second.handle.endpoint();

    let monitor = Arc::new(Transitions::default());
    let transitions = monitor.watch();
    let client = client();
    let connection = client
        .for_remote_access_with(
            &["127.0.0.1:1", first_endpoint.as_str(), second_endpoint.as_str()],
            WireType::Binary,
            session(WireType::Binary),
            Some(monitor.clone()),
            RemoteOptions::new().with_retry_delay(Duration::from_millis(50)),
        )
        .expect("装配远程访问");

    assert!(connection.wait_connected(WAIT), "跳过不可达端点后连上第一个服务端");
    assert_eq!(connection.current_endpoint(), Some(first_endpoint.clone()));
    assert_eq!(
        transitions.recv_timeout(WAIT).expect("连接通知"),
        (true, first_endpoint.clone())
    );

    let (subscriber, events) = entry_events();
    client
        .register_entry_subscriber("/prices", subscriber, None)
        .expect("注册");
    let first_prices = first.tree.acquire_map("/prices").expect("服务端映射");
    first_prices.put("eur", json!(1)).expect("写入第一个服务端");
    assert!(matches!(
        events.recv_timeout(WAIT).expect("来自第一个服务端的事件"),
        MapEvent::Inserted { .. }
    ));

    first.handle.shutdown();
    assert_eq!(
        transitions.recv_timeout(WAIT).expect("断开通知"),
        (false, first_endpoint.clone())
    );
    assert_eq!(
        transitions.recv_timeout(WAIT).expect("重连通知"),
        (true, second_endpoint.clone())
    );
    assert_eq!(connection.current_endpoint(), Some(second_endpoint));

    let second_subscription = second
        .tree
        .acquire_subscription("/prices")
        .expect("服务端订阅");
    assert!(
        wait_until(|| second_subscription.entry_subscriber_count() == 1),
        "订阅在第二个服务端上恢复"
    );
    let second_prices = second.tree.acquire_map("/prices").expect("服务端映射");
    second_prices.put("gbp", json!(2)).expect("写入第二个服务端");
    match events.recv_timeout(WAIT).expect("来自第二个服务端的事件") {
        MapEvent::Inserted { key, .. } => assert_eq!(key, "gbp"),
        other => panic!("应为插入事件，实际为 {other:?}"),
    }

    let prices = client.acquire_map("/prices").expect("远程规则提供映射");
    assert_eq!(prices.get("gbp").expect("经第二个服务端读取"), Some(json!(2)));

    connection.close();
    client.close();
    second.handle.shutdown();
    runtime.block_on(first.handle.join()).expect("第一个服务端正常停止");
    runtime.block_on(second.handle.join()).expect("第二个服务端正常停止");
}
