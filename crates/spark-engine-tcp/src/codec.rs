//! # 文档分帧编解码
//!
//! ## 核心意图（Why）
//! - TCP 是字节流，文档以 4 字节长度前缀分帧（`tokio-util` 的 `LengthDelimitedCodec`），
//!   帧体按连接协商的 [`WireType`] 编码；
//! - 对端在读到握手之前并不知道线格式，因此每个方向的第一帧固定使用 JSON。
//!
//! ## 契约（What）
//! - 每个方向各用一个 [`DocumentCodec`] 实例：第一帧 JSON，之后使用 [`DocumentCodec::set_wire_type`]
//!   设置的格式；
//! - 单帧上限 [`MAX_FRAME_LENGTH`]，超限的帧以 I/O 错误拒绝。

use bytes::{Bytes, BytesMut};
use spark_engine::{Document, WireType};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::TransportError;

/// 单帧字节上限。
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct DocumentCodec {
    frames: LengthDelimitedCodec,
    wire_type: WireType,
    encoded_first: bool,
    decoded_first: bool,
}

impl DocumentCodec {
    pub fn new(wire_type: WireType) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            wire_type,
            encoded_first: false,
            decoded_first: false,
        }
    }

    pub fn wire_type(&self) -> WireType {
        self.wire_type
    }

    /// 设置第一帧之后使用的线格式。
    pub fn set_wire_type(&mut self, wire_type: WireType) {
        self.wire_type = wire_type;
    }

    fn outbound_format(&mut self) -> WireType {
        if std::mem::replace(&mut self.encoded_first, true) {
            self.wire_type
        } else {
            WireType::Json
        }
    }

    fn inbound_format(&mut self) -> WireType {
        if std::mem::replace(&mut self.decoded_first, true) {
            self.wire_type
        } else {
            WireType::Json
        }
    }
}

impl Default for DocumentCodec {
    fn default() -> Self {
        Self::new(WireType::default())
    }
}

/// 按线格式把文档编码为帧体。
pub fn encode_document(wire_type: WireType, document: &Document) -> Result<Vec<u8>, TransportError> {
    let encoded = match wire_type {
        WireType::Json => serde_json::to_vec(document).map_err(|err| err.to_string()),
        WireType::Binary => serde_cbor::to_vec(document).map_err(|err| err.to_string()),
    };
    encoded.map_err(|detail| TransportError::Encode { wire_type, detail })
}

/// 按线格式从帧体解码文档。
pub fn decode_document(wire_type: WireType, frame: &[u8]) -> Result<Document, TransportError> {
    let decoded = match wire_type {
        WireType::Json => serde_json::from_slice(frame).map_err(|err| err.to_string()),
        WireType::Binary => serde_cbor::from_slice(frame).map_err(|err| err.to_string()),
    };
    decoded.map_err(|detail| TransportError::Decode { wire_type, detail })
}

impl Decoder for DocumentCodec {
    type Item = Document;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Document>, TransportError> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        let wire_type = self.inbound_format();
        decode_document(wire_type, &frame).map(Some)
    }
}

impl Encoder<Document> for DocumentCodec {
    type Error = TransportError;

    fn encode(&mut self, document: Document, dst: &mut BytesMut) -> Result<(), TransportError> {
        let wire_type = self.outbound_format();
        let payload = encode_document(wire_type, &document)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}
