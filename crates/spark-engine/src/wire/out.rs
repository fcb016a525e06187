//! 有界输出缓冲：一次写回调最多可承载的文档集合。

use super::document::Document;

/// 默认容量，单次写回调最多排入的文档数。
pub const DEFAULT_OUT_CAPACITY: usize = 256;

/// 写回调使用的输出缓冲。
///
/// - **契约 (What)**：`push` 在缓冲已满时返回 `false` 并丢弃入参以外的任何状态变化；
///   `is_empty` 用于判断本轮写回调是否已经产出数据；
/// - **风险 (Trade-offs)**：容量按文档数而非字节计算，巨型文档仍可能形成大帧。
#[derive(Debug)]
pub struct WireOut {
    documents: Vec<Document>,
    capacity: usize,
}

impl WireOut {
    pub fn new(capacity: usize) -> Self {
        Self {
            documents: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, document: Document) -> bool {
        if self.is_full() {
            return false;
        }
        self.documents.push(document);
        true
    }

    /// 先写通道头再写数据；剩余空间不足两条时整体拒绝。
    pub fn push_on_channel(&mut self, cid: u64, data: Document) -> bool {
        if self.remaining() < 2 {
            return false;
        }
        self.documents.push(Document::channel_header(cid));
        self.documents.push(data);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.documents.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.documents.len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// 取走全部文档，缓冲恢复为空。
    pub fn drain(&mut self) -> Vec<Document> {
        std::mem::take(&mut self.documents)
    }

    pub fn clear(&mut self) {
        self.documents.clear();
    }
}

impl Default for WireOut {
    fn default() -> Self {
        Self::new(DEFAULT_OUT_CAPACITY)
    }
}
