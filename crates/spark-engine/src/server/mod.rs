//! # server 模块
//!
//! ## 定位（Why）
//! - 集群物理连接上的协议状态机与子通道处理器，不依赖具体传输；
//! - 传输层只需实现 [`ConnectionEvents`]，并按顺序调用 `on_initialize` / `on_read` / `on_write`。
//!
//! ## 组成（What）
//! - [`ClusterConnectionHandler`]：握手、准入策略、终止、写者轮转；
//! - [`NetworkContext`]：连接级上下文与子通道标识分配；
//! - [`SubHandler`] / [`SubHandlerRegistry`]：逻辑子通道及其树级注册表；
//! - [`TerminatorHandler`] / [`HeartbeatHandler`]：内建子通道。

mod cluster_handler;
mod heartbeat;
mod network_context;
mod state;
mod sub_handler;

pub use cluster_handler::{CLUSTER_HANDLER_TYPE, CLUSTER_NAME, ClusterConnectionHandler, WIRE_TYPE};
pub use heartbeat::{HEARTBEAT_TYPE, HeartbeatEventHandler, HeartbeatHandler, HeartbeatMonitor};
pub use network_context::{CONNECTION_CID, ConnectionEvents, NetworkContext};
pub use state::{ConnectionState, InitOutcome};
pub use sub_handler::{
    LOCAL_IDENTIFIER, REMOTE_IDENTIFIER, SubHandler, SubHandlerRegistry, TERMINATOR_TYPE,
    TerminatorHandler, sub_channel_header, termination_document,
};
