use std::fmt;

use serde::{Deserialize, Serialize};

/// 集群内的主机标识，取值范围与线上的 32 位整数字段一致。
pub type HostId = i32;

/// 挂载在根资产上的本机标识视图。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HostIdentifier {
    host_id: HostId,
}

impl HostIdentifier {
    pub fn new(host_id: HostId) -> Self {
        Self { host_id }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }
}

impl fmt::Display for HostIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-{}", self.host_id)
    }
}

/// 集群成员的静态描述。
///
/// - **契约 (What)**：`connect_uri` 为 `host:port`，由连接器直接解析；
/// - **风险 (Trade-offs)**：不在此处校验地址格式，错误延迟到建立连接时暴露。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostDetails {
    pub host_id: HostId,
    pub connect_uri: String,
}

impl HostDetails {
    pub fn new(host_id: HostId, connect_uri: impl Into<String>) -> Self {
        Self {
            host_id,
            connect_uri: connect_uri.into(),
        }
    }
}
