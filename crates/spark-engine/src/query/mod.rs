//! # query 模块
//!
//! ## 定位（Why）
//! - 订阅可以附带形如 `price > 10 && side == 'buy'` 的过滤表达式；
//! - 表达式在注册时解析为语法树并缓存，事件到达时直接解释执行，不涉及运行时代码生成。
//!
//! ## 组成（What）
//! - 词法分析、递归下降语法分析与求值器（内部）；
//! - [`FilterCache`] / [`Predicate`]：按 `(值类型, 表达式)` 缓存的谓词；
//! - [`IndexQuery`]：按索引回放的查询描述。

mod ast;
mod cache;
mod index_query;
mod lexer;
mod parser;

pub use cache::{FilterCache, Predicate, ValueSchema};
pub use index_query::IndexQuery;
