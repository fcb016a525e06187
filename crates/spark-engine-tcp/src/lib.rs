#![doc = r#"
# spark-engine-tcp

## 设计动机（Why）
- **定位**：把 `spark-engine` 的集群连接协议与资产树接到 Tokio TCP 上：
  文档分帧、连接驱动、引擎服务端以及带故障转移的远程访问客户端。
- **架构角色**：引擎核心不做 I/O，本 crate 实现其
  [`ConnectionEvents`](spark_engine::server::ConnectionEvents) 契约，
  并负责把同步回调串行地接到异步套接字上。

## 核心契约（What）
- **分帧**：4 字节长度前缀，帧体按连接协商的 [`WireType`](spark_engine::WireType) 编码，
  每个方向的第一帧固定为 JSON；
- **分流**：服务端按第一条通道头的处理器类型区分集群成员与远程会话；
- **错误**：所有失败统一为 [`TransportError`]，带稳定错误码，
  并可转换回 [`EngineError`](spark_engine::EngineError)。

## 实现策略（How）
- `tokio-util` 的 `LengthDelimitedCodec` 负责分帧，`serde_json` / `serde_cbor` 负责帧体；
- 每条连接一个任务，在 `tokio::select!` 中等待入站帧、写唤醒与取消令牌；
- 远程客户端的监督任务运行在资产树的事件循环上，同步视图调用通过通道等待回复。

## 风险与考量（Trade-offs）
- 远程视图方法阻塞调用线程，不应在事件循环工作线程上调用；
- 故障转移不重试进行中的请求，调用方会收到连接关闭错误。
"#]

mod cid;
mod codec;
mod driver;
mod error;
mod protocol;
mod remote;
mod server;
mod server_session;

pub use cid::CidSpace;
pub use codec::{DocumentCodec, MAX_FRAME_LENGTH, decode_document, encode_document};
pub use driver::{
    ClusterConnection, ClusterConnector, DEFAULT_HANDSHAKE_TIMEOUT, FrameReader, FrameWriter,
    SocketEvents, drive_cluster_connection,
};
pub use error::{Operation, Result, TransportError};
pub use protocol::{ChannelTarget, Op};
pub use remote::{
    RemoteAccessExt, RemoteConnection, RemoteKeyValueStore, RemoteObjectSubscription,
    RemoteOptions, RemoteTopicPublisher,
};
pub use server::{EngineServer, ServerHandle, ServerOptions};
