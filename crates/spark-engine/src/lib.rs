//! # spark-engine
//!
//! ## 定位与职责（Why）
//! - 分层资产树：按路径并发地惰性创建节点，每个节点按能力类型惰性构造并缓存视图；
//! - 订阅分发：带引导回放、失败隔离的值/事件扇出；
//! - 集群连接协议：身份握手、准入策略、终止消息、心跳与出站写者轮转。
//!
//! ## 架构嵌入（Where）
//! - 本 crate 不做任何网络 I/O；`spark-engine-tcp` 负责帧编解码与连接驱动，
//!   通过 [`server::ConnectionEvents`] 与协议层交互；
//! - 过滤表达式、子处理器构造器等注册表挂在树上（[`tree::TreeContext`]），不使用进程级全局变量。
//!
//! ## 使用方式（How）
//! ```no_run
//! use spark_engine::{AssetTree, EngineConfig};
//!
//! # fn main() -> spark_engine::Result<()> {
//! let config = EngineConfig::from_toml_str("host_id = 1")?;
//! let tree = AssetTree::new().for_server(&config.event_loop)?;
//! config.install(&tree)?;
//! let map = tree.acquire_map("/prices/fx")?;
//! map.put("EURUSD", serde_json::json!(1.08))?;
//! tree.close();
//! # Ok(())
//! # }
//! ```

/// 集群注册表、主机标识与按远端登记的策略回调。
pub mod cluster;

/// TOML 部署配置及其到资产树的安装。
pub mod config;

/// 错误域与稳定错误码。
///
/// - **契约定位 (What)**：`thiserror` 派生的 [`EngineError`]，附带 `code()` 与 [`ErrorKind`] 分类；
/// - **风险提示 (Trade-offs)**：订阅者回调不使用本错误域，而是返回 [`pubsub::InvalidSubscriber`]。
pub mod error;

/// 键值存储、引用、发布者与主题发布者视图。
pub mod map;

/// 全局 `tracing` 订阅器安装助手。
pub mod observability;

/// 订阅者集合与简单值订阅。
pub mod pubsub;

/// 过滤表达式解释器与缓存。
pub mod query;

/// 集群连接协议状态机与子通道处理器。
pub mod server;

/// 远程客户端会话身份与连接观察者。
pub mod session;

/// 共享事件循环。
pub mod threads;

/// 资产节点、资产树与请求上下文。
pub mod tree;

/// 能力枚举、视图枚举与视图规则。
pub mod view;

/// 线协议文档模型与出站队列。
pub mod wire;

pub use cluster::{Clusters, EngineCluster, HostId, HostIdentifier};
pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind, Result};
pub use map::{KeyValueStore, MapEvent, ObjectSubscription, Reference, TopicPublisher};
pub use pubsub::{FnSubscriber, InvalidSubscriber, Registration, Subscriber, Subscription};
pub use server::{ClusterConnectionHandler, ConnectionState, InitOutcome, NetworkContext};
pub use session::{ClientConnectionMonitor, SessionDetails};
pub use threads::EventLoop;
pub use tree::{Asset, AssetTree, RequestContext};
pub use view::{Capability, View};
pub use wire::{Document, WireType};
