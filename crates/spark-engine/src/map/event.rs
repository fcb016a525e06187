use serde::{Deserialize, Serialize};

use crate::wire::Value;

/// 键值映射的变更事件。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapEvent {
    /// 新增键。
    Inserted {
        asset: String,
        key: String,
        value: Value,
    },
    /// 覆盖已有键。
    Updated {
        asset: String,
        key: String,
        old_value: Value,
        value: Value,
    },
    /// 删除键。
    Removed {
        asset: String,
        key: String,
        old_value: Value,
    },
}

impl MapEvent {
    pub fn asset(&self) -> &str {
        match self {
            MapEvent::Inserted { asset, .. }
            | MapEvent::Updated { asset, .. }
            | MapEvent::Removed { asset, .. } => asset,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            MapEvent::Inserted { key, .. }
            | MapEvent::Updated { key, .. }
            | MapEvent::Removed { key, .. } => key,
        }
    }

    /// 变更后的值；删除事件为 `None`。
    pub fn value(&self) -> Option<&Value> {
        match self {
            MapEvent::Inserted { value, .. } | MapEvent::Updated { value, .. } => Some(value),
            MapEvent::Removed { .. } => None,
        }
    }

    pub fn old_value(&self) -> Option<&Value> {
        match self {
            MapEvent::Inserted { .. } => None,
            MapEvent::Updated { old_value, .. } | MapEvent::Removed { old_value, .. } => {
                Some(old_value)
            }
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, MapEvent::Removed { .. })
    }
}

/// 主题消息：映射中的键即主题。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub topic: String,
    pub message: Value,
}
