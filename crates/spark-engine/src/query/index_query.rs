use std::fmt;

use serde::{Deserialize, Serialize};

use super::cache::{FilterCache, Predicate};
use crate::error::Result;

/// 按索引回放事件的查询描述。
///
/// - **契约 (What)**：`value_type` 与 `select` 共同决定过滤谓词；`from_index` 为回放起点，
///   `0` 表示从头；`event_name` 为空时匹配所有事件名；
/// - **执行 (How)**：[`IndexQuery::filter`] 经 [`FilterCache`] 编译，相同查询共享谓词。
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexQuery {
    pub value_type: String,
    pub select: String,
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub from_index: u64,
}

impl IndexQuery {
    pub fn new(value_type: &str, select: &str) -> Self {
        Self {
            value_type: value_type.to_owned(),
            select: select.to_owned(),
            ..Self::default()
        }
    }

    pub fn with_event_name(mut self, event_name: &str) -> Self {
        self.event_name = event_name.to_owned();
        self
    }

    pub fn with_from_index(mut self, from_index: u64) -> Self {
        self.from_index = from_index;
        self
    }

    pub fn filter(&self, cache: &FilterCache) -> Result<Predicate> {
        cache.compile(&self.value_type, &self.select)
    }

    pub fn matches_event(&self, event_name: &str) -> bool {
        self.event_name.is_empty() || self.event_name == event_name
    }
}

impl fmt::Display for IndexQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IndexQuery{{valueType={}, select={}, eventName={}, fromIndex={}}}",
            self.value_type, self.select, self.event_name, self.from_index
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn queries_share_compiled_filters() {
        let cache = FilterCache::new();
        let query = IndexQuery::new("Order", "qty > 5")
            .with_event_name("onOrder")
            .with_from_index(42);
        let first = query.filter(&cache).expect("合法查询");
        let second = query.clone().filter(&cache).expect("命中缓存");
        assert!(Predicate::ptr_eq(&first, &second));
        assert!(first.test(&json!({"qty": 6})));
        assert!(query.matches_event("onOrder"));
        assert!(!query.matches_event("onTrade"));

        let encoded = serde_json::to_value(&query).expect("可序列化");
        assert_eq!(encoded["fromIndex"], json!(42));
        assert_eq!(
            query.to_string(),
            "IndexQuery{valueType=Order, select=qty > 5, eventName=onOrder, fromIndex=42}"
        );
    }
}
