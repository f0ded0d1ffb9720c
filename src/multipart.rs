//! `multipart/mixed` framing for mask results.
//!
//! Layout of one response:
//!
//! ```text
//! --{boundary}\r\n<headers>Content-Length: n\r\n\r\n<metadata json>\r\n
//! --{boundary}\r\n<headers>Content-Length: n\r\n\r\n<object json>\r\n
//! --{boundary}\r\n<headers>Content-Length: n\r\n\r\n<png bytes>
//! \r\n--{boundary}--\r\n
//! ```
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

const BOUNDARY_PREFIX: &str = "mask-";
const BOUNDARY_HEX_LEN: usize = 16;
const JSON_CONTENT_TYPE: &str = "application/json";
const PNG_CONTENT_TYPE: &str = "image/png";
pub const OBJECT_ID_HEADER: &str = "X-Object-Id";

/// Fresh per response; never checked against payload bytes.
pub fn generate_boundary() -> String {
    let suffix: String = (0..BOUNDARY_HEX_LEN)
        .map(|_| {
            let nibble = rand::random_range(0..16u32);
            char::from_digit(nibble, 16).unwrap_or('0')
        })
        .collect();
    format!("{}{}", BOUNDARY_PREFIX, suffix)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub content_type: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Bytes,
}

impl Part {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            content_type: JSON_CONTENT_TYPE,
            headers: Vec::new(),
            body: Bytes::from(serde_json::to_vec(value)?),
        })
    }

    pub fn png(object_id: i64, body: Bytes) -> Self {
        Self {
            content_type: PNG_CONTENT_TYPE,
            headers: vec![(OBJECT_ID_HEADER, object_id.to_string())],
            body,
        }
    }

    pub fn is_json(&self) -> bool {
        self.content_type == JSON_CONTENT_TYPE
    }

    fn encode(&self, boundary: &str) -> Bytes {
        let mut header = format!("--{}\r\nContent-Type: {}\r\n", boundary, self.content_type);
        for (key, value) in &self.headers {
            header.push_str(&format!("{}: {}\r\n", key, value));
        }
        header.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));

        let mut buf = BytesMut::with_capacity(header.len() + self.body.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FrameMetadata<'a> {
    session_id: &'a str,
    frame_index: u32,
    object_count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MaskMetadata {
    object_id: i64,
    score: f32,
    width: u32,
    height: u32,
}

/// Ordered part list for one frame's masks.
#[derive(Debug, Clone)]
pub struct MultipartMaskResponse {
    boundary: String,
    parts: Vec<Part>,
}

impl MultipartMaskResponse {
    pub fn new() -> Self {
        Self::with_boundary(generate_boundary())
    }

    pub fn with_boundary(boundary: String) -> Self {
        Self {
            boundary,
            parts: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/mixed; boundary={}", self.boundary)
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn add_metadata(
        &mut self,
        session_id: &str,
        frame_index: u32,
        object_count: usize,
    ) -> Result<&mut Self, serde_json::Error> {
        self.parts.push(Part::json(&FrameMetadata {
            session_id,
            frame_index,
            object_count,
        })?);
        Ok(self)
    }

    pub fn add_mask(
        &mut self,
        object_id: i64,
        score: f32,
        width: u32,
        height: u32,
        png: Bytes,
    ) -> Result<&mut Self, serde_json::Error> {
        self.parts.push(Part::json(&MaskMetadata {
            object_id,
            score,
            width,
            height,
        })?);
        self.parts.push(Part::png(object_id, png));
        Ok(self)
    }

    /// Stream chunks: one per part, the separators between them, then the closing marker.
    pub fn into_chunks(self) -> Vec<Bytes> {
        let last = self.parts.len().saturating_sub(1);
        let mut chunks = Vec::with_capacity(self.parts.len() * 2 + 1);
        for (i, part) in self.parts.iter().enumerate() {
            chunks.push(part.encode(&self.boundary));
            if i < last {
                chunks.push(Bytes::from_static(b"\r\n"));
            }
        }
        chunks.push(Bytes::from(format!("\r\n--{}--\r\n", self.boundary)));
        chunks
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for chunk in self.clone().into_chunks() {
            buf.put_slice(&chunk);
        }
        buf.freeze()
    }
}

impl Default for MultipartMaskResponse {
    fn default() -> Self {
        Self::new()
    }
}
