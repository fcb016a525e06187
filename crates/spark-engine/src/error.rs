//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为资产树、视图解析、订阅分发与集群握手提供集中定义的错误域；
//! - 每个变体携带稳定错误码，日志与告警可以直接按 `code()` 聚合。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，满足 `Send + Sync + 'static`；
//! - [`ErrorKind`] 给出粗粒度分类：配置错误、协议违例、解码失败、已关闭、传输失败；
//! - 订阅者回调不使用本错误域，而是返回 [`InvalidSubscriber`](crate::pubsub::InvalidSubscriber)。

use thiserror::Error;

use crate::cluster::HostId;
use crate::view::Capability;

/// 错误的粗粒度分类。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// 缺失视图工厂、集群未登记、身份不符等部署期问题。
    Configuration,
    /// 对端违反握手或子通道协议。
    ProtocolViolation,
    /// 值读取器或线格式解码失败。
    Decode,
    /// 目标对象已经关闭。
    Closed,
    /// 事件循环或底层传输失败。
    Transport,
}

/// 引擎核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把视图缺失、握手违例、解码失败等异常收敛到一个枚举，调用方用 `?` 即可传播；
/// - **契约 (What)**：
///   - 变体字段均为拥有所有权的 `String`/`Copy` 值，可跨线程移动；
///   - [`EngineError::code`] 返回稳定的 `engine.*` 错误码，[`EngineError::kind`] 返回分类；
/// - **设计权衡 (Trade-offs)**：使用 `String` 保存上下文，牺牲少量堆分配换取可读的诊断信息。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum EngineError {
    /// 祖先链上找不到能生成该能力的规则。
    #[error("no view rule can provide `{capability}` at `{path}`")]
    ViewUnavailable { capability: Capability, path: String },

    /// 已注册的视图与请求的能力不匹配。
    #[error("view registered at `{path}` is not a `{expected}`")]
    ViewTypeMismatch { path: String, expected: Capability },

    /// 握手中声明的集群在 Clusters 视图里不存在。
    #[error("cluster `{name}` is not registered")]
    ClusterNotFound { name: String },

    /// 握手解析出的本地标识与本机 HostIdentifier 视图不一致。
    #[error("local identifier {local} does not match host identifier {host}")]
    IdentityMismatch { local: HostId, host: HostId },

    /// 对端声明的远端标识与本地标识相同。
    #[error("remote identifier equals local identifier {identifier}")]
    SelfConnection { identifier: HostId },

    /// 对端消息顺序或内容违反协议，例如在通道头之前发送数据。
    #[error("protocol violation: {detail}")]
    ProtocolViolation { detail: String },

    /// 值读取器产出的类型与订阅者期望不符。
    #[error("value reader `{reader}` produced an unexpected type: {detail}")]
    DecodeMismatch { reader: String, detail: String },

    /// 原始字节无法解码。
    #[error("failed to decode {what}: {detail}")]
    Decode { what: String, detail: String },

    /// 目标已关闭，不再接受操作。
    #[error("`{what}` is closed")]
    Closed { what: String },

    /// 过滤表达式无法编译。
    #[error("invalid filter `{expression}` for `{value_type}`: {detail}")]
    Filter {
        value_type: String,
        expression: String,
        detail: String,
    },

    /// 配置文件缺失、格式错误或语义冲突。
    #[error("configuration error: {detail}")]
    Config { detail: String },

    /// 事件循环无法创建或已经停止。
    #[error("event loop failure: {detail}")]
    EventLoop { detail: String },

    /// 文档字段缺失或类型不符。
    #[error("wire field `{field}`: {detail}")]
    Wire { field: String, detail: String },

    /// 远程视图背后的连接失败、超时或对端返回错误。
    #[error("transport failure: {detail}")]
    Transport { detail: String },
}

impl EngineError {
    /// 稳定错误码，供日志字段与告警规则引用。
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ViewUnavailable { .. } => "engine.view.unavailable",
            EngineError::ViewTypeMismatch { .. } => "engine.view.type_mismatch",
            EngineError::ClusterNotFound { .. } => "engine.cluster.not_found",
            EngineError::IdentityMismatch { .. } => "engine.cluster.identity_mismatch",
            EngineError::SelfConnection { .. } => "engine.cluster.self_connection",
            EngineError::ProtocolViolation { .. } => "engine.protocol.violation",
            EngineError::DecodeMismatch { .. } => "engine.decode.mismatch",
            EngineError::Decode { .. } => "engine.decode.malformed",
            EngineError::Closed { .. } => "engine.closed",
            EngineError::Filter { .. } => "engine.query.filter",
            EngineError::Config { .. } => "engine.config",
            EngineError::EventLoop { .. } => "engine.event_loop",
            EngineError::Wire { .. } => "engine.wire.field",
            EngineError::Transport { .. } => "engine.transport",
        }
    }

    /// 错误分类。
    ///
    /// - **契约 (What)**：过滤编译错误归为配置类，字段缺失归为协议违例；
    /// - **执行 (How)**：纯匹配，无分配。
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ViewUnavailable { .. }
            | EngineError::ViewTypeMismatch { .. }
            | EngineError::ClusterNotFound { .. }
            | EngineError::IdentityMismatch { .. }
            | EngineError::Filter { .. }
            | EngineError::Config { .. } => ErrorKind::Configuration,
            EngineError::SelfConnection { .. }
            | EngineError::ProtocolViolation { .. }
            | EngineError::Wire { .. } => ErrorKind::ProtocolViolation,
            EngineError::DecodeMismatch { .. } | EngineError::Decode { .. } => ErrorKind::Decode,
            EngineError::Closed { .. } => ErrorKind::Closed,
            EngineError::EventLoop { .. } | EngineError::Transport { .. } => ErrorKind::Transport,
        }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        EngineError::ProtocolViolation {
            detail: detail.into(),
        }
    }

    pub fn closed(what: impl Into<String>) -> Self {
        EngineError::Closed { what: what.into() }
    }

    pub fn config(detail: impl Into<String>) -> Self {
        EngineError::Config {
            detail: detail.into(),
        }
    }

    pub fn wire(field: &str, detail: impl Into<String>) -> Self {
        EngineError::Wire {
            field: field.to_owned(),
            detail: detail.into(),
        }
    }
}

/// 引擎统一结果别名。
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_kinds_are_stable() {
        let err = EngineError::ViewUnavailable {
            capability: Capability::KeyValueStore,
            path: "/a/b".to_owned(),
        };
        assert_eq!(err.code(), "engine.view.unavailable");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("/a/b"));

        let violation = EngineError::protocol("data before header");
        assert_eq!(violation.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(
            EngineError::closed("tree-1").kind(),
            ErrorKind::Closed,
            "关闭类错误应单独归类"
        );
    }
}
