//! # wire 模块
//!
//! ## 定位（Why）
//! - 定义连接两端交换的文档模型、有界输出缓冲与出站发布队列；
//! - 具体字节编码留给传输层，核心层只暴露 [`WireType`] 供握手协商。
//!
//! ## 组成（What）
//! - [`Document`]：通道头或数据，字段表为 JSON 值；
//! - [`WireOut`]：一次写回调的输出缓冲；
//! - [`WireOutPublisher`]：线程安全的出站队列，同时也是连接的第一个 [`WireWriter`]。

mod document;
mod out;
mod publisher;

pub use document::{
    CID, CSP, Document, DocumentKind, FieldReader, Fields, HANDLER, HANDLER_TYPE, Value, WireType,
};
pub use out::{DEFAULT_OUT_CAPACITY, WireOut};
pub use publisher::{WireOutPublisher, WireWriter, WriteWaker};
