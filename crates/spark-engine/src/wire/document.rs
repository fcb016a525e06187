//! 文档模型：一条线协议消息要么是通道头（元数据），要么是数据。
//!
//! 字段值统一使用 [`serde_json::Value`]，具体编码（JSON 或 CBOR）由传输层按 [`WireType`]
//! 选择，核心引擎只关心字段语义。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// 字段值类型。
pub type Value = serde_json::Value;

/// 字段表。
pub type Fields = serde_json::Map<String, Value>;

/// 通道头中描述子处理器的嵌套对象字段。
pub const HANDLER: &str = "handler";
/// 子处理器描述中的类型名字段。
pub const HANDLER_TYPE: &str = "type";
/// 子通道标识字段。
pub const CID: &str = "cid";
/// 通道路径字段（客户端会话使用）。
pub const CSP: &str = "csp";

/// 连接协商出的线格式。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireType {
    /// 紧凑二进制（CBOR）。
    #[default]
    Binary,
    /// 自描述文本（JSON）。
    Json,
}

impl WireType {
    pub fn as_str(self) -> &'static str {
        match self {
            WireType::Binary => "binary",
            WireType::Json => "json",
        }
    }

    /// 从名称解析，大小写不敏感。
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("binary") {
            Some(WireType::Binary)
        } else if name.eq_ignore_ascii_case("json") {
            Some(WireType::Json)
        } else {
            None
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 文档种类。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// 通道头：建立或切换当前子通道。
    MetaData,
    /// 发往当前子通道的数据。
    Data,
}

/// 线协议上的一条消息。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    kind: DocumentKind,
    #[serde(default)]
    fields: Fields,
}

impl Document {
    /// 空的通道头文档。
    pub fn meta() -> Self {
        Self {
            kind: DocumentKind::MetaData,
            fields: Fields::new(),
        }
    }

    /// 空的数据文档。
    pub fn data() -> Self {
        Self {
            kind: DocumentKind::Data,
            fields: Fields::new(),
        }
    }

    /// 指向子通道 `cid` 的通道头。
    pub fn channel_header(cid: u64) -> Self {
        Self::meta().with(CID, cid)
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn is_meta_data(&self) -> bool {
        self.kind == DocumentKind::MetaData
    }

    pub fn is_data(&self) -> bool {
        self.kind == DocumentKind::Data
    }

    /// 链式写入字段。
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_owned(), value.into());
        self
    }

    pub fn write(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(name.to_owned(), value.into());
        self
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    /// 可选的子通道标识。
    pub fn cid(&self) -> Option<u64> {
        self.fields.get(CID).and_then(Value::as_u64)
    }
}

/// 字段读取工具，同时服务 [`Document`] 与嵌套的 [`Fields`] 描述对象。
///
/// # 教案式说明
/// - **意图 (Why)**：握手描述、子处理器描述与请求体都以字段表出现，读取逻辑集中在一处；
/// - **契约 (What)**：缺失或类型不符统一返回 [`EngineError::Wire`]，错误信息包含字段名；
/// - **执行 (How)**：只要求实现者提供 `field_table`，其余方法为默认实现。
pub trait FieldReader {
    fn field_table(&self) -> &Fields;

    fn field(&self, name: &str) -> Option<&Value> {
        self.field_table().get(name)
    }

    fn read_value(&self, name: &str) -> Result<&Value> {
        self.field(name)
            .ok_or_else(|| EngineError::wire(name, "missing"))
    }

    fn read_i32(&self, name: &str) -> Result<i32> {
        let value = self.read_value(name)?;
        value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| EngineError::wire(name, format!("expected i32, found {value}")))
    }

    fn read_u64(&self, name: &str) -> Result<u64> {
        let value = self.read_value(name)?;
        value
            .as_u64()
            .ok_or_else(|| EngineError::wire(name, format!("expected u64, found {value}")))
    }

    fn read_bool(&self, name: &str) -> Result<bool> {
        let value = self.read_value(name)?;
        value
            .as_bool()
            .ok_or_else(|| EngineError::wire(name, format!("expected bool, found {value}")))
    }

    fn read_text(&self, name: &str) -> Result<&str> {
        let value = self.read_value(name)?;
        value
            .as_str()
            .ok_or_else(|| EngineError::wire(name, format!("expected text, found {value}")))
    }

    fn read_object(&self, name: &str) -> Result<&Fields> {
        let value = self.read_value(name)?;
        value
            .as_object()
            .ok_or_else(|| EngineError::wire(name, format!("expected object, found {value}")))
    }

    fn read_wire_type(&self, name: &str) -> Result<WireType> {
        let text = self.read_text(name)?;
        WireType::from_name(text)
            .ok_or_else(|| EngineError::wire(name, format!("unknown wire type `{text}`")))
    }
}

impl FieldReader for Document {
    fn field_table(&self) -> &Fields {
        &self.fields
    }
}

impl FieldReader for Fields {
    fn field_table(&self) -> &Fields {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_reads_report_field_names() {
        let doc = Document::data()
            .with("id", 7)
            .with("name", "alpha")
            .with("wireType", "JSON");
        assert_eq!(doc.read_i32("id").expect("读取 id"), 7);
        assert_eq!(doc.read_text("name").expect("读取 name"), "alpha");
        assert_eq!(
            doc.read_wire_type("wireType").expect("读取 wireType"),
            WireType::Json
        );

        let err = doc.read_i32("name").expect_err("文本不能读成整数");
        assert!(matches!(err, EngineError::Wire { ref field, .. } if field == "name"));
        assert!(doc.read_bool("absent").is_err());
    }

    #[test]
    fn channel_header_carries_cid() {
        let header = Document::channel_header(42);
        assert!(header.is_meta_data());
        assert_eq!(header.cid(), Some(42));
        assert_eq!(Document::data().cid(), None);
    }
}
