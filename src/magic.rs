//! Content sniffing: mime type, encoding, and description from a file header.
//!
//! Signatures come from `infer`; anything it does not recognise is classified
//! as text or opaque data by inspecting the bytes.

use std::io::Read;

/// Placeholder stored when a file's content cannot be classified.
pub const UNKNOWN: &str = "__UNKNOWN__";

/// Bytes read from the start of a file for classification.
pub const HEAD_BYTES: u64 = 8 * 1024;

/// Classification of one file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sniffed {
    pub mime: String,
    pub encoding: String,
    pub description: String,
}

/// Read at most [`HEAD_BYTES`] from `reader`.
pub fn read_head(reader: impl Read) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(HEAD_BYTES as usize);
    reader.take(HEAD_BYTES).read_to_end(&mut head)?;
    Ok(head)
}

pub fn sniff(head: &[u8]) -> Sniffed {
    let encoding = detect_encoding(head).to_string();

    if head.is_empty() {
        return Sniffed {
            mime: "inode/x-empty".to_string(),
            encoding,
            description: "empty".to_string(),
        };
    }

    if let Some(kind) = infer::get(head) {
        return Sniffed {
            mime: kind.mime_type().to_string(),
            encoding,
            description: format!("{:?} ({})", kind.matcher_type(), kind.extension()),
        };
    }

    if encoding == "binary" {
        Sniffed {
            mime: "application/octet-stream".to_string(),
            encoding,
            description: "data".to_string(),
        }
    } else {
        let description = if encoding == "us-ascii" {
            "ASCII text"
        } else {
            "Unicode text, UTF-8 text"
        };
        Sniffed {
            mime: "text/plain".to_string(),
            encoding,
            description: description.to_string(),
        }
    }
}

/// `us-ascii`, `utf-8`, or `binary`.
///
/// A multi-byte sequence cut off at the end of the header still counts as
/// UTF-8.
pub fn detect_encoding(head: &[u8]) -> &'static str {
    if head.contains(&0) {
        return "binary";
    }
    if head.is_ascii() {
        return "us-ascii";
    }
    match std::str::from_utf8(head) {
        Ok(_) => "utf-8",
        Err(e) if e.error_len().is_none() => "utf-8",
        Err(_) => "binary",
    }
}
