//! # 引擎 TCP 服务端
//!
//! ## 核心意图（Why）
//! - 同一监听端口同时接入集群连接与远程客户端会话，按第一条通道头的处理器类型分流；
//! - 服务端关停令牌派生出每条连接的子令牌，关停一次即可拆除全部连接。
//!
//! ## 契约（What）
//! - 第一帧必须是 `cid = 0` 的通道头，且携带 `handler` 对象；否则关闭该连接，监听不受影响；
//! - `handler.type = "cluster"`：构造 [`ClusterConnectionHandler`] 并交给集群连接驱动；
//! - `handler.type = "session"`：进入远程会话服务；
//! - 单个连接的失败只记录日志，不影响监听循环。
//!
//! ## 设计权衡
//! - `accept` 失败（例如文件描述符耗尽）记录告警后继续循环，不退出服务；
//! - 握手超时由 [`ServerOptions::handshake_timeout`] 控制，防止空连接长期占用任务。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use spark_engine::server::{NetworkContext, CLUSTER_HANDLER_TYPE};
use spark_engine::session::SESSION_HANDLER_TYPE;
use spark_engine::wire::{FieldReader, HANDLER, HANDLER_TYPE};
use spark_engine::{
    Asset, AssetTree, ClusterConnectionHandler, EngineError, InitOutcome, SessionDetails,
    WireType,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{
    DEFAULT_HANDSHAKE_TIMEOUT, SocketEvents, drive_cluster_connection, frame, read_first,
};
use crate::error::{Operation, Result, TransportError};
use crate::server_session::serve_session;

/// 服务端选项。
#[derive(Clone, Debug)]
pub struct ServerOptions {
    handshake_timeout: Duration,
}

impl ServerOptions {
    pub fn new() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// 新连接发送第一条通道头的时限。
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// 绑定在某个地址上的引擎服务端。
///
/// # 教案式说明
/// - **意图 (Why)**：把监听、握手分流与连接驱动装配在一起，调用方只需提供资产树与地址；
/// - **契约 (What)**：
///   - `bind` 成功后 [`EngineServer::local_addr`] 给出实际端口，绑定 `:0` 时可用于测试；
///   - `run` 在关停令牌取消前持续接受连接；关停后已建立的连接随之关闭；
/// - **风险 (Trade-offs)**：每条连接一个 Tokio 任务，连接数受运行时调度能力约束。
#[derive(Debug)]
pub struct EngineServer {
    root: Arc<Asset>,
    listener: TcpListener,
    local_addr: SocketAddr,
    options: ServerOptions,
    shutdown: CancellationToken,
}

impl EngineServer {
    pub async fn bind(tree: &AssetTree, addr: &str) -> Result<Self> {
        Self::bind_with_options(tree, addr, ServerOptions::default()).await
    }

    pub async fn bind_with_options(
        tree: &AssetTree,
        addr: &str,
        options: ServerOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| TransportError::io(Operation::Bind, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| TransportError::io(Operation::Bind, err))?;
        info!(%local_addr, tree = %tree, "engine server bound");
        Ok(Self {
            root: tree.root().clone(),
            listener,
            local_addr,
            options,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 取消该令牌即关停服务端及其全部连接。
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 接受连接直到关停。
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        tokio::spawn(handle_socket(
                            self.root.clone(),
                            stream,
                            peer,
                            self.options.clone(),
                            self.shutdown.child_token(),
                        ));
                    }
                    Err(err) => {
                        let err = TransportError::io(Operation::Accept, err);
                        warn!(code = err.code(), error = %err, "accept failed");
                    }
                }
            }
        }
        info!(local_addr = %self.local_addr, "engine server stopped");
        Ok(())
    }

    /// 在给定运行时上后台运行。
    pub fn spawn(self, handle: &Handle) -> ServerHandle {
        let local_addr = self.local_addr;
        let shutdown = self.shutdown.clone();
        let task = handle.spawn(self.run());
        ServerHandle {
            local_addr,
            shutdown,
            task,
        }
    }
}

/// 后台运行中的服务端。
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 形如 `127.0.0.1:9090` 的连接端点。
    pub fn endpoint(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(join) => Err(TransportError::closed(format!(
                "engine server {}: {join}",
                self.local_addr
            ))),
        }
    }
}

async fn handle_socket(
    root: Arc<Asset>,
    stream: TcpStream,
    peer: SocketAddr,
    options: ServerOptions,
    cancel: CancellationToken,
) {
    if let Err(err) = serve_socket(root, stream, peer, options, cancel).await {
        warn!(%peer, code = err.code(), error = %err, "connection closed with error");
    }
}

async fn serve_socket(
    root: Arc<Asset>,
    stream: TcpStream,
    peer: SocketAddr,
    options: ServerOptions,
    cancel: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let endpoint = peer.to_string();
    let (mut reader, mut writer) = frame(stream, WireType::default());
    let Some(header) = read_first(&mut reader, &endpoint, options.handshake_timeout).await? else {
        debug!(%peer, "peer closed before sending a header");
        return Ok(());
    };
    if !header.is_meta_data() || header.cid() != Some(0) {
        return Err(EngineError::protocol("the first frame must be the channel 0 header").into());
    }
    let descriptor = header.read_object(HANDLER)?;
    let handler_type = descriptor.read_text(HANDLER_TYPE)?;

    if handler_type == CLUSTER_HANDLER_TYPE {
        let handler = ClusterConnectionHandler::from_descriptor(descriptor)?;
        reader.decoder_mut().set_wire_type(handler.wire_type());
        writer.encoder_mut().set_wire_type(handler.wire_type());
        let events = SocketEvents::new(cancel);
        let network = Arc::new(NetworkContext::new(root, true, events.clone()));
        if handler.on_initialize(network)? == InitOutcome::Aborted {
            handler.close();
            return Ok(());
        }
        drive_cluster_connection(handler, events, reader, writer).await
    } else if handler_type == SESSION_HANDLER_TYPE {
        let session = SessionDetails::from_descriptor(descriptor)?;
        reader.decoder_mut().set_wire_type(session.wire_type);
        writer.encoder_mut().set_wire_type(session.wire_type);
        info!(
            user = %session.user_id,
            client = %session.client_id,
            wire_type = %session.wire_type,
            %peer,
            "remote session opened"
        );
        let events = SocketEvents::new(cancel);
        serve_session(root, session, events, reader, writer, endpoint).await
    } else {
        Err(EngineError::protocol(format!("unknown handler type `{handler_type}`")).into())
    }
}
