//! # 过滤器缓存
//!
//! ## 核心意图（Why）
//! - 同一 `(值类型, 表达式)` 会被大量订阅重复使用，编译一次、按键缓存；
//! - 值类型可以声明字段表，编译时拒绝引用未知字段的表达式，错误在注册阶段而非事件阶段暴露。
//!
//! ## 契约（What）
//! - 编译成功的谓词按键缓存，重复编译返回同一个实例（[`Predicate::ptr_eq`] 成立）；
//! - 编译失败不缓存，返回 [`EngineError::Filter`]，错误信息包含表达式与原因；
//! - 未声明字段表的值类型不做字段校验。

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::ast::{Expr, truthy};
use super::parser::parse;
use crate::error::{EngineError, Result};
use crate::wire::Value;

struct CompiledFilter {
    value_type: String,
    expression: String,
    ast: Expr,
}

/// 编译后的过滤谓词，克隆只复制 `Arc`。
#[derive(Clone)]
pub struct Predicate {
    inner: Arc<CompiledFilter>,
}

impl Predicate {
    /// 对值求真。
    pub fn test(&self, value: &Value) -> bool {
        truthy(&self.inner.ast.evaluate(value))
    }

    /// 返回表达式的原始求值结果。
    pub fn evaluate(&self, value: &Value) -> Value {
        self.inner.ast.evaluate(value)
    }

    pub fn value_type(&self) -> &str {
        &self.inner.value_type
    }

    pub fn expression(&self) -> &str {
        &self.inner.expression
    }

    pub fn ptr_eq(a: &Predicate, b: &Predicate) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("value_type", &self.inner.value_type)
            .field("expression", &self.inner.expression)
            .finish()
    }
}

/// 值类型的字段声明。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ValueSchema {
    fields: BTreeSet<String>,
}

impl ValueSchema {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains(name)
    }
}

/// 树级过滤器缓存。
#[derive(Default)]
pub struct FilterCache {
    compiled: DashMap<(String, String), Predicate>,
    schemas: DashMap<String, Arc<ValueSchema>>,
}

impl FilterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明值类型的字段表；已缓存的该类型谓词不受影响。
    pub fn register_schema(&self, value_type: &str, schema: ValueSchema) {
        self.schemas.insert(value_type.to_owned(), Arc::new(schema));
    }

    /// 编译或命中缓存。
    pub fn compile(&self, value_type: &str, expression: &str) -> Result<Predicate> {
        let key = (value_type.to_owned(), expression.to_owned());
        if let Some(hit) = self.compiled.get(&key) {
            return Ok(hit.value().clone());
        }

        let failure = |detail: String| EngineError::Filter {
            value_type: value_type.to_owned(),
            expression: expression.to_owned(),
            detail,
        };
        let ast = parse(expression).map_err(failure)?;
        if let Some(schema) = self.schemas.get(value_type).map(|s| s.value().clone()) {
            let mut fields = Vec::new();
            ast.collect_fields(&mut fields);
            if let Some(unknown) = fields.iter().find(|field| !schema.has_field(field)) {
                return Err(failure(format!(
                    "`{value_type}` has no field `{unknown}`"
                )));
            }
        }

        debug!(value_type, expression, "filter compiled");
        let predicate = Predicate {
            inner: Arc::new(CompiledFilter {
                value_type: value_type.to_owned(),
                expression: expression.to_owned(),
                ast,
            }),
        };
        Ok(self
            .compiled
            .entry(key)
            .or_insert(predicate)
            .value()
            .clone())
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

impl fmt::Debug for FilterCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterCache")
            .field("compiled", &self.compiled.len())
            .field("schemas", &self.schemas.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn compile_is_cached_per_type_and_expression() {
        let cache = FilterCache::new();
        let a = cache.compile("Trade", "price > 10").expect("合法表达式");
        let b = cache.compile("Trade", "price > 10").expect("命中缓存");
        let c = cache.compile("Quote", "price > 10").expect("不同类型单独缓存");
        assert!(Predicate::ptr_eq(&a, &b));
        assert!(!Predicate::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
        assert!(a.test(&json!({"price": 11})));
        assert!(!a.test(&json!({"price": 9})));
    }

    #[test]
    fn invalid_expressions_are_not_cached() {
        let cache = FilterCache::new();
        let err = cache.compile("Trade", "price >").expect_err("语法错误");
        assert!(matches!(
            err,
            EngineError::Filter { ref expression, .. } if expression == "price >"
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn deeply_nested_expressions_fail_as_filter_errors() {
        let cache = FilterCache::new();
        let source = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        let err = cache.compile("value", &source).expect_err("嵌套过深");
        assert_eq!(err.code(), "engine.query.filter");
        assert!(cache.is_empty());
    }

    #[test]
    fn schema_rejects_unknown_fields() {
        let cache = FilterCache::new();
        cache.register_schema("Trade", ValueSchema::new(["price", "qty"]));
        assert!(cache.compile("Trade", "price * qty > 100").is_ok());
        let err = cache
            .compile("Trade", "volume > 1")
            .expect_err("volume 未声明");
        assert!(err.to_string().contains("volume"));
        assert!(cache.compile("Untyped", "volume > 1").is_ok());
    }

    proptest! {
        #[test]
        fn threshold_filter_matches_direct_comparison(price in -1000i64..1000, threshold in -1000i64..1000) {
            let cache = FilterCache::new();
            let predicate = cache
                .compile("Trade", &format!("price >= {}", threshold.abs()))
                .expect("阈值表达式合法");
            let expected = price >= threshold.abs();
            prop_assert_eq!(predicate.test(&json!({ "price": price })), expected);
        }
    }
}
