//! Built-in handler plugins.
//!
//! | Handler           | Schema     | Mime patterns                   | Requires      |
//! |-------------------|------------|---------------------------------|---------------|
//! | `CoreHandler`     | `core`     | `*`                             |               |
//! | `AudioHandler`    | `audio`    | `audio/*`                       | `CoreHandler` |
//! | `DocumentHandler` | `document` | PDF, EPUB, OpenDocument, Office | `CoreHandler` |

pub mod audio;
pub mod core;
pub mod document;

use chrono::{DateTime, SecondsFormat, Utc};

/// Text values are truncated to this many characters before storage.
pub const MAX_VALUE_CHARS: usize = 511;

pub(crate) fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((end, _)) => value[..end].to_string(),
        None => value.to_string(),
    }
}

/// Timestamps are stored as RFC 3339 text with second precision.
pub(crate) fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn timestamps_are_second_precision_utc() {
        let t = DateTime::parse_from_rfc3339("2024-03-01T10:20:30.456+02:00")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(timestamp(t), "2024-03-01T08:20:30Z");
    }
}
