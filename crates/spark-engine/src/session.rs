//! # 客户端会话
//!
//! 远程访问客户端在连接的第一条通道头里声明 [`SessionDetails`]；服务端据此区分客户端会话与集群成员。
//! 客户端的故障转移通过 [`ClientConnectionMonitor`] 对外可见。

use std::env;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::server::{CONNECTION_CID, sub_channel_header};
use crate::wire::{Document, FieldReader, Fields, HANDLER_TYPE, Value, WireType};

/// 客户端会话通道头的类型名。
pub const SESSION_HANDLER_TYPE: &str = "session";

const USER_ID: &str = "userId";
const CLIENT_ID: &str = "clientId";
const WIRE_TYPE: &str = "wireType";

/// 调用方身份与协商参数。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetails {
    pub user_id: String,
    pub client_id: Uuid,
    pub wire_type: WireType,
}

impl SessionDetails {
    /// 使用操作系统当前用户与随机客户端标识。
    pub fn new(wire_type: WireType) -> Self {
        Self::for_user(&default_user_id(), wire_type)
    }

    pub fn for_user(user_id: &str, wire_type: WireType) -> Self {
        Self {
            user_id: user_id.to_owned(),
            client_id: Uuid::new_v4(),
            wire_type,
        }
    }

    /// 会话建立时发送的第一条通道头。
    pub fn header_document(&self) -> Document {
        let mut descriptor = Fields::new();
        descriptor.insert(HANDLER_TYPE.to_owned(), Value::from(SESSION_HANDLER_TYPE));
        descriptor.insert(USER_ID.to_owned(), Value::from(self.user_id.as_str()));
        descriptor.insert(CLIENT_ID.to_owned(), Value::from(self.client_id.to_string()));
        descriptor.insert(WIRE_TYPE.to_owned(), Value::from(self.wire_type.as_str()));
        sub_channel_header(CONNECTION_CID, descriptor)
    }

    pub fn from_descriptor(descriptor: &Fields) -> Result<Self> {
        let client_id = descriptor.read_text(CLIENT_ID)?;
        let client_id = Uuid::parse_str(client_id)
            .map_err(|err| EngineError::wire(CLIENT_ID, err.to_string()))?;
        Ok(Self {
            user_id: descriptor.read_text(USER_ID)?.to_owned(),
            client_id,
            wire_type: descriptor.read_wire_type(WIRE_TYPE)?,
        })
    }
}

impl Default for SessionDetails {
    fn default() -> Self {
        Self::new(WireType::default())
    }
}

fn default_user_id() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_owned())
}

/// 客户端连接变化的观察者。
pub trait ClientConnectionMonitor: Send + Sync {
    fn on_connected(&self, name: &str, endpoint: &str);
    fn on_disconnected(&self, name: &str, endpoint: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::HANDLER;

    #[test]
    fn session_header_round_trips() {
        let details = SessionDetails::for_user("alice", WireType::Json);
        let header = details.header_document();
        assert!(header.is_meta_data());
        let descriptor = header.read_object(HANDLER).expect("通道头携带会话描述");
        assert_eq!(descriptor.read_text(HANDLER_TYPE).expect("类型名"), SESSION_HANDLER_TYPE);
        assert_eq!(SessionDetails::from_descriptor(descriptor).expect("可解析"), details);
        assert_ne!(SessionDetails::default().client_id, details.client_id);
    }
}
