//! # 传输错误域
//!
//! ## 核心意图（Why）
//! - 套接字、分帧、编解码与引擎协议错误在连接驱动里汇合，统一为 [`TransportError`] 后用 `?` 传播；
//! - 每个变体携带稳定错误码，日志字段与引擎侧的 `engine.*` 错误码并列聚合。
//!
//! ## 契约（What）
//! - `From<io::Error>` 归为 [`Operation::Socket`]；需要更精确的操作名时使用 [`TransportError::io`]；
//! - 远程视图实现的是引擎 trait，错误经 `From<TransportError> for EngineError` 回到引擎错误域。

use std::io;
use std::time::Duration;

use spark_engine::{EngineError, WireType};
use thiserror::Error;

/// 发生 I/O 错误时正在执行的操作。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Bind,
    Accept,
    Connect,
    Socket,
}

impl Operation {
    pub fn code(self) -> &'static str {
        match self {
            Operation::Bind => "spark.engine.tcp.bind_failed",
            Operation::Accept => "spark.engine.tcp.accept_failed",
            Operation::Connect => "spark.engine.tcp.connect_failed",
            Operation::Socket => "spark.engine.tcp.socket_failed",
        }
    }

    fn message(self) -> &'static str {
        match self {
            Operation::Bind => "tcp bind",
            Operation::Accept => "tcp accept",
            Operation::Connect => "tcp connect",
            Operation::Socket => "tcp read/write",
        }
    }
}

/// TCP 传输层错误。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{}: {source}", .operation.message())]
    Io {
        operation: Operation,
        #[source]
        source: io::Error,
    },

    /// 文档无法按协商的线格式编码。
    #[error("failed to encode {wire_type} frame: {detail}")]
    Encode { wire_type: WireType, detail: String },

    /// 帧内容无法按协商的线格式解码。
    #[error("failed to decode {wire_type} frame: {detail}")]
    Decode { wire_type: WireType, detail: String },

    /// 引擎协议层拒绝了对端消息。
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// 在限定时间内没有完成建连或收到第一条通道头。
    #[error("handshake with `{endpoint}` timed out after {timeout:?}")]
    HandshakeTimeout { endpoint: String, timeout: Duration },

    /// 远程请求在限定时间内没有收到回复。
    #[error("request {tid} timed out after {timeout:?}")]
    RequestTimeout { tid: u64, timeout: Duration },

    /// 对端以错误回复了远程请求。
    #[error("remote `{code}`: {message}")]
    Remote { code: String, message: String },

    /// 连接在请求完成之前断开或已被关闭。
    #[error("connection `{name}` is closed")]
    ConnectionClosed { name: String },
}

impl TransportError {
    pub fn io(operation: Operation, source: io::Error) -> Self {
        TransportError::Io { operation, source }
    }

    pub(crate) fn closed(name: impl Into<String>) -> Self {
        TransportError::ConnectionClosed { name: name.into() }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Io { operation, .. } => operation.code(),
            TransportError::Encode { .. } => "spark.engine.tcp.encode_failed",
            TransportError::Decode { .. } => "spark.engine.tcp.decode_failed",
            TransportError::Engine(err) => err.code(),
            TransportError::HandshakeTimeout { .. } => "spark.engine.tcp.handshake_timeout",
            TransportError::RequestTimeout { .. } => "spark.engine.tcp.request_timeout",
            TransportError::Remote { .. } => "spark.engine.tcp.remote_error",
            TransportError::ConnectionClosed { .. } => "spark.engine.tcp.closed",
        }
    }

    /// 对端主动断开或连接被重置，属于故障转移可以处理的情形。
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            TransportError::ConnectionClosed { .. } => true,
            _ => false,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(source: io::Error) -> Self {
        TransportError::io(Operation::Socket, source)
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Engine(inner) => inner,
            other => EngineError::Transport {
                detail: format!("[{}] {other}", other.code()),
            },
        }
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
