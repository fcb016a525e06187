//! # 子通道处理器
//!
//! ## 核心意图（Why）
//! - 一条物理连接上复用多个逻辑子通道（终止、心跳……），每个子通道由一个处理器负责；
//! - 通道头携带处理器描述，接收方按类型名在树级注册表中找到构造器并实例化。
//!
//! ## 契约（What）
//! - 通道头形如 `meta { cid, handler: { type, ... } }`；只有 `cid` 的通道头表示切换到已建立的子通道；
//! - 新建的处理器先收到 `set_identifiers`，再收到 `on_initialize`；
//! - 未登记的类型名是协议违例。

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::cluster_handler::ClusterConnectionHandler;
use super::heartbeat::HeartbeatHandler;
use crate::cluster::HostId;
use crate::error::{EngineError, Result};
use crate::wire::{CID, Document, FieldReader, Fields, HANDLER, HANDLER_TYPE, Value, WireOut};

/// 握手与终止描述中的本地标识字段。
pub const LOCAL_IDENTIFIER: &str = "localIdentifier";
/// 握手与终止描述中的远端标识字段。
pub const REMOTE_IDENTIFIER: &str = "remoteIdentifier";

/// 终止处理器的类型名。
pub const TERMINATOR_TYPE: &str = "terminator";

/// 逻辑子通道处理器。
///
/// # 教案式说明
/// - **意图 (Why)**：子通道协议各自独立演进，连接处理器只负责路由；
/// - **契约 (What)**：回调在连接的读路径上串行执行，不得阻塞；返回错误会拆除整条连接；
/// - **风险 (Trade-offs)**：`on_initialize`/`on_read` 拿到的是连接的强引用，处理器若要在后台任务中
///   使用连接，应自行降级为 `Weak`。
pub trait SubHandler: Send {
    /// 注册表中的类型名。
    fn handler_type(&self) -> &str;

    /// 写入通道头的描述，必须包含 `type` 字段。
    fn descriptor(&self) -> Fields;

    fn set_identifiers(&mut self, local: HostId, remote: HostId);

    fn on_initialize(
        &mut self,
        _connection: &Arc<ClusterConnectionHandler>,
        _cid: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn on_read(
        &mut self,
        connection: &Arc<ClusterConnectionHandler>,
        cid: u64,
        document: &Document,
        out: &mut WireOut,
    ) -> Result<()>;

    fn on_close(&mut self) {}
}

type SubHandlerFactory = Arc<dyn Fn(&Fields) -> Result<Box<dyn SubHandler>> + Send + Sync>;

/// 类型名到子处理器构造器的注册表。
#[derive(Default)]
pub struct SubHandlerRegistry {
    factories: DashMap<String, SubHandlerFactory>,
}

impl SubHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置终止与心跳处理器。
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(TERMINATOR_TYPE, |fields| {
            Ok(Box::new(TerminatorHandler::from_descriptor(fields)?) as Box<dyn SubHandler>)
        });
        registry.register(super::heartbeat::HEARTBEAT_TYPE, |fields| {
            Ok(Box::new(HeartbeatHandler::from_descriptor(fields)?) as Box<dyn SubHandler>)
        });
        registry
    }

    /// 登记构造器；同名登记覆盖旧值。
    pub fn register<F>(&self, handler_type: &str, factory: F)
    where
        F: Fn(&Fields) -> Result<Box<dyn SubHandler>> + Send + Sync + 'static,
    {
        self.factories
            .insert(handler_type.to_owned(), Arc::new(factory));
    }

    pub fn contains(&self, handler_type: &str) -> bool {
        self.factories.contains_key(handler_type)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// 按描述中的 `type` 字段构造处理器。
    pub fn create(&self, descriptor: &Fields) -> Result<Box<dyn SubHandler>> {
        let handler_type = descriptor.read_text(HANDLER_TYPE)?;
        let factory = self
            .factories
            .get(handler_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                EngineError::protocol(format!("unknown sub handler type `{handler_type}`"))
            })?;
        factory(descriptor)
    }
}

impl fmt::Debug for SubHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("SubHandlerRegistry")
            .field("types", &names)
            .finish()
    }
}

/// 建立子通道的通道头。
pub fn sub_channel_header(cid: u64, descriptor: Fields) -> Document {
    Document::meta()
        .with(CID, cid)
        .with(HANDLER, Value::Object(descriptor))
}

/// 终止消息：以发送方视角的 `(local, remote)` 寻址，单独占用一个子通道。
pub fn termination_document(local: HostId, remote: HostId, cid: u64) -> Document {
    let mut descriptor = Fields::new();
    descriptor.insert(HANDLER_TYPE.to_owned(), Value::from(TERMINATOR_TYPE));
    descriptor.insert(LOCAL_IDENTIFIER.to_owned(), Value::from(local));
    descriptor.insert(REMOTE_IDENTIFIER.to_owned(), Value::from(remote));
    sub_channel_header(cid, descriptor)
}

/// 接收终止消息的处理器：通知终止回调并关闭连接。
#[derive(Debug, Default)]
pub struct TerminatorHandler {
    sender_local: Option<HostId>,
    sender_remote: Option<HostId>,
    local: Option<HostId>,
    remote: Option<HostId>,
}

impl TerminatorHandler {
    pub fn from_descriptor(descriptor: &Fields) -> Result<Self> {
        Ok(Self {
            sender_local: descriptor.read_i32(LOCAL_IDENTIFIER).ok(),
            sender_remote: descriptor.read_i32(REMOTE_IDENTIFIER).ok(),
            local: None,
            remote: None,
        })
    }
}

impl SubHandler for TerminatorHandler {
    fn handler_type(&self) -> &str {
        TERMINATOR_TYPE
    }

    fn descriptor(&self) -> Fields {
        let mut descriptor = Fields::new();
        descriptor.insert(HANDLER_TYPE.to_owned(), Value::from(TERMINATOR_TYPE));
        if let Some(local) = self.local {
            descriptor.insert(LOCAL_IDENTIFIER.to_owned(), Value::from(local));
        }
        if let Some(remote) = self.remote {
            descriptor.insert(REMOTE_IDENTIFIER.to_owned(), Value::from(remote));
        }
        descriptor
    }

    fn set_identifiers(&mut self, local: HostId, remote: HostId) {
        self.local = Some(local);
        self.remote = Some(remote);
    }

    fn on_initialize(&mut self, connection: &Arc<ClusterConnectionHandler>, cid: u64) -> Result<()> {
        let remote = self.remote.unwrap_or(connection.remote_identifier());
        if self.sender_local.is_some_and(|sender| sender != remote) {
            debug!(cid, sender = ?self.sender_local, remote, "termination sender differs from connection peer");
        }
        info!(cid, remote, addressed_to = ?self.sender_remote, "peer announced termination");
        if let Some(handler) = connection.termination_handler() {
            handler.on_process_termination(remote);
        }
        connection.close();
        Ok(())
    }

    fn on_read(
        &mut self,
        _connection: &Arc<ClusterConnectionHandler>,
        _cid: u64,
        _document: &Document,
        _out: &mut WireOut,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_builds_known_types_and_rejects_unknown() {
        let registry = SubHandlerRegistry::with_defaults();
        assert!(registry.contains(TERMINATOR_TYPE));
        assert_eq!(registry.len(), 2);

        let doc = termination_document(1, 2, 7);
        assert!(doc.is_meta_data());
        assert_eq!(doc.cid(), Some(7));
        let descriptor = doc.read_object(HANDLER).expect("终止消息携带处理器描述");
        assert_eq!(descriptor.read_i32(LOCAL_IDENTIFIER).expect("local"), 1);
        assert_eq!(descriptor.read_i32(REMOTE_IDENTIFIER).expect("remote"), 2);
        let handler = registry.create(descriptor).expect("终止处理器已登记");
        assert_eq!(handler.handler_type(), TERMINATOR_TYPE);

        let mut unknown = Fields::new();
        unknown.insert(HANDLER_TYPE.to_owned(), Value::from("replication"));
        let err = registry.create(&unknown).err().expect("未知类型应失败");
        assert_eq!(err.code(), "engine.protocol.violation");
    }
}
