//! # 远程访问会话协议
//!
//! ## 契约（What）
//! - 客户端每次请求发送一对文档：通道头 `meta{cid, csp?, view?}` 与数据 `data{tid, op, ...}`；
//!   通道在某条连接上第一次使用时，通道头携带 `csp`（资产路径）与 `view`（能力名），之后只带 `cid`；
//! - 服务端以同一 `cid` 的通道头加数据回复：
//!   - `data{tid, reply}`：成功结果；
//!   - `data{tid, error{code, message}}`：失败；
//!   - `data{tid, event}`：订阅事件；
//!   - `data{tid, end: true}`：订阅结束。
//! - 可选值统一编码为 `{"found": bool, "value": v}`，`null` 值与缺失可以区分。

use serde_json::json;
use spark_engine::wire::{CID, CSP, FieldReader, Value};
use spark_engine::{Capability, Document, EngineError, Registration, Result as EngineResult};

use crate::error::TransportError;

pub const TID: &str = "tid";
pub const OP: &str = "op";
pub const VIEW: &str = "view";
pub const KEY: &str = "key";
pub const VALUE: &str = "value";
pub const TOPIC: &str = "topic";
pub const BOOTSTRAP: &str = "bootstrap";
pub const FILTER: &str = "filter";
pub const FILTER_TYPE: &str = "filterType";
pub const TARGET: &str = "target";
pub const REPLY: &str = "reply";
pub const ERROR: &str = "error";
pub const EVENT: &str = "event";
pub const END: &str = "end";

/// 远程请求的操作名。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Op {
    Get,
    Put,
    PutIfAbsent,
    Remove,
    ContainsKey,
    Len,
    Keys,
    Entries,
    Clear,
    Publish,
    SubscribeKeys,
    SubscribeEntries,
    SubscribeTopics,
    Unsubscribe,
}

impl Op {
    pub const ALL: [Op; 14] = [
        Op::Get,
        Op::Put,
        Op::PutIfAbsent,
        Op::Remove,
        Op::ContainsKey,
        Op::Len,
        Op::Keys,
        Op::Entries,
        Op::Clear,
        Op::Publish,
        Op::SubscribeKeys,
        Op::SubscribeEntries,
        Op::SubscribeTopics,
        Op::Unsubscribe,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Op::Get => "get",
            Op::Put => "put",
            Op::PutIfAbsent => "put_if_absent",
            Op::Remove => "remove",
            Op::ContainsKey => "contains_key",
            Op::Len => "len",
            Op::Keys => "keys",
            Op::Entries => "entries",
            Op::Clear => "clear",
            Op::Publish => "publish",
            Op::SubscribeKeys => "subscribe_keys",
            Op::SubscribeEntries => "subscribe_entries",
            Op::SubscribeTopics => "subscribe_topics",
            Op::Unsubscribe => "unsubscribe",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Op::ALL.into_iter().find(|op| op.as_str() == name)
    }

    /// 操作所作用的视图能力；通道声明的能力必须与之一致。
    pub fn capability(self) -> Capability {
        match self {
            Op::Publish => Capability::TopicPublisher,
            Op::SubscribeKeys | Op::SubscribeEntries | Op::SubscribeTopics | Op::Unsubscribe => {
                Capability::ObjectSubscription
            }
            _ => Capability::KeyValueStore,
        }
    }

    pub fn is_subscribe(self) -> bool {
        matches!(
            self,
            Op::SubscribeKeys | Op::SubscribeEntries | Op::SubscribeTopics
        )
    }
}

/// 通道头声明的目标：资产路径与能力。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ChannelTarget {
    pub csp: String,
    pub capability: Capability,
}

impl ChannelTarget {
    pub fn new(csp: impl Into<String>, capability: Capability) -> Self {
        Self {
            csp: csp.into(),
            capability,
        }
    }

    /// 从通道头读取目标；只带 `cid` 的通道头返回 `None`。
    pub fn from_header(header: &Document) -> EngineResult<Option<Self>> {
        if header.field(CSP).is_none() {
            return Ok(None);
        }
        let csp = header.read_text(CSP)?;
        let view = header.read_text(VIEW)?;
        let capability = Capability::from_name(view).ok_or_else(|| EngineError::Wire {
            field: VIEW.to_owned(),
            detail: format!("unknown capability `{view}`"),
        })?;
        Ok(Some(Self::new(csp, capability)))
    }
}

/// 首次使用通道时的完整通道头。
pub fn channel_open(cid: u64, target: &ChannelTarget) -> Document {
    Document::meta()
        .with(CID, cid)
        .with(CSP, target.csp.as_str())
        .with(VIEW, target.capability.as_str())
}

pub fn request(tid: u64, op: Op) -> Document {
    Document::data().with(TID, tid).with(OP, op.as_str())
}

pub fn reply(tid: u64, value: Value) -> Document {
    Document::data().with(TID, tid).with(REPLY, value)
}

pub fn error_reply(tid: u64, err: &EngineError) -> Document {
    Document::data().with(TID, tid).with(
        ERROR,
        json!({ "code": err.code(), "message": err.to_string() }),
    )
}

pub fn event(tid: u64, payload: Value) -> Document {
    Document::data().with(TID, tid).with(EVENT, payload)
}

pub fn end(tid: u64) -> Document {
    Document::data().with(TID, tid).with(END, true)
}

pub fn optional(value: Option<Value>) -> Value {
    match value {
        Some(value) => json!({ "found": true, "value": value }),
        None => json!({ "found": false }),
    }
}

pub fn read_optional(reply: &Value) -> Option<Value> {
    match reply.get("found").and_then(Value::as_bool) {
        Some(true) => Some(reply.get(VALUE).cloned().unwrap_or(Value::Null)),
        _ => None,
    }
}

/// 订阅请求的回复值。
pub fn registration_name(registration: Registration) -> &'static str {
    match registration {
        Registration::Added => "added",
        Registration::AlreadyPresent => "already_present",
        Registration::Rejected => "rejected",
        Registration::Closed => "closed",
    }
}

pub fn parse_registration(reply: &Value) -> Option<Registration> {
    match reply.as_str()? {
        "added" => Some(Registration::Added),
        "already_present" => Some(Registration::AlreadyPresent),
        "rejected" => Some(Registration::Rejected),
        "closed" => Some(Registration::Closed),
        _ => None,
    }
}

/// 服务端发给客户端的一条数据文档。
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Reply { tid: u64, value: Value },
    Failure { tid: u64, code: String, message: String },
    Event { tid: u64, payload: Value },
    End { tid: u64 },
}

impl Inbound {
    pub fn parse(document: &Document) -> EngineResult<Self> {
        let tid = document.read_u64(TID)?;
        if let Some(value) = document.field(REPLY) {
            return Ok(Inbound::Reply {
                tid,
                value: value.clone(),
            });
        }
        if let Some(error) = document.field(ERROR) {
            let text = |name: &str| {
                error
                    .get(name)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned()
            };
            return Ok(Inbound::Failure {
                tid,
                code: text("code"),
                message: text("message"),
            });
        }
        if let Some(payload) = document.field(EVENT) {
            return Ok(Inbound::Event {
                tid,
                payload: payload.clone(),
            });
        }
        if document.field(END).and_then(Value::as_bool) == Some(true) {
            return Ok(Inbound::End { tid });
        }
        Err(EngineError::ProtocolViolation {
            detail: format!("data document for tid {tid} carries no reply, error, event or end"),
        })
    }

    pub fn tid(&self) -> u64 {
        match self {
            Inbound::Reply { tid, .. }
            | Inbound::Failure { tid, .. }
            | Inbound::Event { tid, .. }
            | Inbound::End { tid } => *tid,
        }
    }

    /// 把回复类文档转成请求结果；事件与结束文档不是合法回复。
    pub fn into_reply(self) -> Result<Value, TransportError> {
        match self {
            Inbound::Reply { value, .. } => Ok(value),
            Inbound::Failure { code, message, .. } => Err(TransportError::Remote { code, message }),
            other => Err(TransportError::Engine(EngineError::ProtocolViolation {
                detail: format!("expected a reply for tid {}", other.tid()),
            })),
        }
    }
}
