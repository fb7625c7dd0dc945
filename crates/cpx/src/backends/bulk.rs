//! 📦 Bulk framing: the loading-dock format between us and every store.
//!
//! One document per frame:
//!
//! ```text
//! {"uri":"/a.xml","format":"xml","length":12,"partition":"p1","metadata":{...}}\n
//! <12 raw bytes>\n
//! ```
//!
//! The header is one line of JSON. The body is exactly `length` bytes, whatever they are,
//! newlines and zero bytes included, then one `\n` to keep `tail -f` users sane. A naked
//! document has `"length":null` and no body at all. It's NDJSON that went to the gym. 🦆

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::common::{ContentKind, Document, DocumentMetadata};
use crate::errors::PumpError;

/// 📨 A document on the wire: where it goes, which shard it goes to, and the document.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BulkEntry {
    pub(crate) uri: String,
    pub(crate) partition: Option<String>,
    pub(crate) document: Document,
}

impl BulkEntry {
    pub(crate) fn new(uri: impl Into<String>, document: Document) -> Self {
        Self {
            uri: uri.into(),
            partition: None,
            document,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    uri: String,
    format: ContentKind,
    length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<DocumentMetadata>,
}

/// 📤 Frame a batch into one request body.
pub(crate) fn encode(entries: &[BulkEntry]) -> Result<Vec<u8>> {
    let capacity: usize = entries.iter().map(|e| e.document.content_len() + 128).sum();
    let mut body = Vec::with_capacity(capacity);
    for entry in entries {
        let header = FrameHeader {
            uri: entry.uri.clone(),
            format: entry.document.kind,
            length: entry.document.content.as_ref().map(|c| c.len() as u64),
            partition: entry.partition.clone(),
            metadata: entry.document.metadata.clone(),
        };
        serde_json::to_writer(&mut body, &header)
            .with_context(|| format!("💀 Could not serialize the frame header for '{}'", entry.uri))?;
        body.push(b'\n');
        if let Some(content) = &entry.document.content {
            body.extend_from_slice(content);
            body.push(b'\n');
        }
    }
    Ok(body)
}

/// 📥 Unframe a body back into entries. Truncation anywhere is a stream format error.
pub(crate) fn decode(source_name: &str, body: &[u8]) -> Result<Vec<BulkEntry>> {
    let mut entries = Vec::new();
    let mut cursor = 0usize;
    while cursor < body.len() {
        // -- 🔍 blank lines between frames are tolerated, like pauses between jokes
        if body[cursor] == b'\n' {
            cursor += 1;
            continue;
        }
        let line_end = memchr::memchr(b'\n', &body[cursor..])
            .map(|pos| cursor + pos)
            .ok_or_else(|| PumpError::stream(source_name, "frame header without a newline"))?;
        let header: FrameHeader = serde_json::from_slice(&body[cursor..line_end]).map_err(|e| {
            PumpError::stream(source_name, format!("unparseable frame header: {e}"))
        })?;
        cursor = line_end + 1;

        let content = match header.length {
            Some(length) => {
                let end = cursor
                    .checked_add(length as usize)
                    .filter(|end| *end <= body.len())
                    .ok_or_else(|| {
                        PumpError::stream(
                            source_name,
                            format!("frame for '{}' promised {length} bytes and ran out", header.uri),
                        )
                    })?;
                let bytes = body[cursor..end].to_vec();
                cursor = end;
                if body.get(cursor) == Some(&b'\n') {
                    cursor += 1;
                }
                Some(bytes)
            }
            None => None,
        };

        entries.push(BulkEntry {
            uri: header.uri,
            partition: header.partition,
            document: Document {
                content,
                kind: header.format,
                metadata: header.metadata,
            },
        });
    }
    Ok(entries)
}
