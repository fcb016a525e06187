//! # 连接驱动
//!
//! ## 核心意图（Why）
//! - 协议状态机只提供同步的 `on_read` / `on_write` 回调，驱动负责把它们接到 Tokio 套接字上；
//! - 协议层通过 [`ConnectionEvents`] 请求“尽快写一次”或“拆除连接”，驱动把它们翻译成
//!   `Notify` 唤醒与取消令牌。
//!
//! ## 契约（What）
//! - 每条连接一个驱动任务，读写都在该任务内串行执行，回调不会并发进入同一个处理器；
//! - 每轮先把处理器可写的文档全部写出并 `flush`，再等待入站帧、写唤醒或取消三者之一；
//! - 驱动退出时总会调用处理器的 `close`，对端断开、协议违例与本地关闭走同一条收尾路径。

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use spark_engine::server::{ConnectionEvents, NetworkContext};
use spark_engine::wire::{WireOut, WireWriter, WriteWaker};
use spark_engine::{ClusterConnectionHandler, Document, EngineError, HostId, InitOutcome, WireType};
use spark_engine::tree::Asset;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::DocumentCodec;
use crate::error::{Operation, Result, TransportError};

pub type FrameReader = FramedRead<OwnedReadHalf, DocumentCodec>;
pub type FrameWriter = FramedWrite<OwnedWriteHalf, DocumentCodec>;

/// 默认建连与首帧等待时限。
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 拆分套接字并为两个方向各装一个文档编解码器。
pub(crate) fn frame(stream: TcpStream, wire_type: WireType) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    (
        FramedRead::new(read, DocumentCodec::new(wire_type)),
        FramedWrite::new(write, DocumentCodec::new(wire_type)),
    )
}

/// 带时限地读取第一帧。
pub(crate) async fn read_first(
    reader: &mut FrameReader,
    endpoint: &str,
    timeout: Duration,
) -> Result<Option<Document>> {
    match tokio::time::timeout(timeout, reader.next()).await {
        Ok(Some(frame)) => frame.map(Some),
        Ok(None) => Ok(None),
        Err(_) => Err(TransportError::HandshakeTimeout {
            endpoint: endpoint.to_owned(),
            timeout,
        }),
    }
}

/// 带时限地建立 TCP 连接。
pub(crate) async fn connect_stream(endpoint: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
        Ok(connected) => connected.map_err(|err| TransportError::io(Operation::Connect, err))?,
        Err(_) => {
            return Err(TransportError::HandshakeTimeout {
                endpoint: endpoint.to_owned(),
                timeout,
            });
        }
    };
    stream
        .set_nodelay(true)
        .map_err(|err| TransportError::io(Operation::Connect, err))?;
    Ok(stream)
}

/// [`ConnectionEvents`] 的 Tokio 实现。
///
/// - **契约 (What)**：`wake` 保存一个许可，驱动即使尚未进入等待也不会丢失唤醒；
///   `close` 取消令牌，可以重复调用；
/// - **执行 (How)**：令牌通常是服务端关停令牌的子令牌，服务端关停会拆除全部连接。
#[derive(Debug)]
pub struct SocketEvents {
    wake: Notify,
    cancel: CancellationToken,
}

impl SocketEvents {
    pub fn new(cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            wake: Notify::new(),
            cancel,
        })
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }
}

impl WriteWaker for SocketEvents {
    fn wake(&self) {
        self.wake.notify_one();
    }
}

impl ConnectionEvents for SocketEvents {
    fn close(&self) {
        self.cancel.cancel();
    }
}

/// 把处理器当前可写的文档全部写出。
async fn write_pending(
    handler: &ClusterConnectionHandler,
    writer: &mut FrameWriter,
    out: &mut WireOut,
) -> Result<()> {
    loop {
        handler.on_write(out);
        if out.is_empty() {
            break;
        }
        for document in out.drain() {
            writer.feed(document).await?;
        }
    }
    writer.flush().await
}

/// 把出站队列中的文档全部写出；会话与远程客户端共用。
pub(crate) async fn write_queued(
    source: &dyn WireWriter,
    writer: &mut FrameWriter,
    out: &mut WireOut,
) -> Result<()> {
    loop {
        source.write_to(out);
        if out.is_empty() {
            break;
        }
        for document in out.drain() {
            writer.feed(document).await?;
        }
    }
    writer.flush().await
}

/// 驱动一条已经完成初始化的集群连接，直到任一方关闭。
pub async fn drive_cluster_connection(
    handler: Arc<ClusterConnectionHandler>,
    events: Arc<SocketEvents>,
    mut reader: FrameReader,
    mut writer: FrameWriter,
) -> Result<()> {
    let mut out = WireOut::default();
    let result = loop {
        if let Err(err) = write_pending(&handler, &mut writer, &mut out).await {
            break Err(err);
        }
        if handler.is_closed() {
            break Ok(());
        }
        tokio::select! {
            _ = events.cancel.cancelled() => break Ok(()),
            _ = events.woken() => {}
            frame = reader.next() => match frame {
                Some(Ok(document)) => {
                    if let Err(err) = handler.on_read(&document, &mut out) {
                        break Err(err.into());
                    }
                }
                Some(Err(err)) => break Err(err),
                None => {
                    debug!(remote = handler.remote_identifier(), "peer closed the cluster connection");
                    break Ok(());
                }
            }
        }
    };
    if let Err(err) = &result {
        warn!(
            local = handler.local_identifier(),
            remote = handler.remote_identifier(),
            code = err.code(),
            error = %err,
            "cluster connection failed"
        );
    }
    handler.close();
    events.close();
    result
}

/// 主动发起集群连接。
#[derive(Clone, Debug)]
pub struct ClusterConnector {
    connect_timeout: Duration,
}

impl ClusterConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 连接 `endpoint` 上的主机 `remote`，完成握手与初始化后在后台驱动连接。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 本机标识取自 `root` 上的 HostIdentifier 视图，线格式取自集群配置；
    ///   - 握手描述是连接上的第一帧；
    ///   - 集群未登记时在建连之前返回 [`EngineError::ClusterNotFound`]；
    ///   - 返回时初始化已经完成，[`ClusterConnection::outcome`] 给出结果；
    /// - **风险 (Trade-offs)**：策略拒绝发生在对端，本端只会在收到终止消息后关闭。
    pub async fn connect(
        &self,
        root: &Arc<Asset>,
        cluster_name: &str,
        remote: HostId,
        endpoint: &str,
    ) -> Result<ClusterConnection> {
        let local = root
            .host_identifier()
            .ok_or_else(|| EngineError::Config {
                detail: "cluster connections need a HostIdentifier view on the root".to_owned(),
            })?
            .host_id();
        if local == remote {
            return Err(EngineError::SelfConnection { identifier: local }.into());
        }
        let cluster = root
            .acquire_clusters()?
            .get(cluster_name)
            .ok_or_else(|| EngineError::ClusterNotFound {
                name: cluster_name.to_owned(),
            })?;

        let stream = connect_stream(endpoint, self.connect_timeout).await?;
        let (reader, mut writer) = frame(stream, cluster.wire_type());
        let handler =
            ClusterConnectionHandler::new(local, remote, cluster_name, cluster.wire_type());
        writer.send(handler.handshake_document()).await?;

        let events = SocketEvents::new(CancellationToken::new());
        let network = Arc::new(NetworkContext::new(root.clone(), false, events.clone()));
        let outcome = handler.on_initialize(network)?;
        if outcome == InitOutcome::Aborted {
            handler.close();
            return Err(EngineError::ClusterNotFound {
                name: cluster_name.to_owned(),
            }
            .into());
        }
        info!(local, remote, endpoint, cluster = cluster_name, "cluster connection opened");
        let task = tokio::spawn(drive_cluster_connection(
            handler.clone(),
            events,
            reader,
            writer,
        ));
        Ok(ClusterConnection {
            handler,
            outcome,
            task,
        })
    }
}

impl Default for ClusterConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// 后台驱动中的集群连接。
#[derive(Debug)]
pub struct ClusterConnection {
    handler: Arc<ClusterConnectionHandler>,
    outcome: InitOutcome,
    task: JoinHandle<Result<()>>,
}

impl ClusterConnection {
    pub fn handler(&self) -> &Arc<ClusterConnectionHandler> {
        &self.handler
    }

    pub fn outcome(&self) -> InitOutcome {
        self.outcome
    }

    /// 向对端发送终止消息并在宽限期后关闭。
    pub fn terminate(&self) {
        self.handler.terminate();
    }

    pub fn close(&self) {
        self.handler.close();
    }

    /// 等待驱动任务结束。
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(join) => Err(TransportError::closed(format!(
                "cluster connection to {}: {join}",
                self.handler.remote_identifier()
            ))),
        }
    }
}
