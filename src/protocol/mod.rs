//! Result protocol: the tagged frame set carried over the channel and the
//! decode-side state machine that turns it into typed rows.
//!
//! Frames, in the order a well-behaved worker produces them:
//!
//! ```text
//! Schema        ('T')  column shape, at most once, before any Row
//! Row           ('D')  one tuple, binary-encoded per column
//! CommandDone   ('C')  completion tag, e.g. "UPDATE 3"
//! Error/Notice  ('E'/'N')  structured diagnostics
//! AsyncEvent    ('A')  out-of-band notification, forwarded verbatim
//! Ready         ('Z')  terminal marker, nothing follows
//! ```

mod decoder;
mod frame;
mod types;

pub use decoder::{ResultDecoder, StreamItem};
pub use frame::{
    ColumnDesc, Frame, Severity, WireError, TAG_ASYNC_EVENT, TAG_COMMAND_DONE, TAG_ERROR,
    TAG_NOTICE, TAG_READY, TAG_ROW, TAG_SCHEMA,
};
pub use types::{decode_value, encode_value, has_binary_decoder, ColumnType, Value};

/// Convert text received in the channel's transport encoding (UTF-8 on the
/// wire) back into a native string. Invalid sequences are replaced rather
/// than propagated; the two processes do not necessarily share one string
/// representation.
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Truncate a string to at most `max` bytes without splitting a character.
pub(crate) fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_text_replaces_invalid_sequences() {
        assert_eq!(decode_text(b"ok"), "ok");
        assert_eq!(decode_text(&[0x66, 0xFF, 0x6F]), "f\u{FFFD}o");
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        assert_eq!(truncate_utf8("abcdef", 4), "abcd");
        // 'é' is two bytes; cutting at 3 must not split it.
        assert_eq!(truncate_utf8("aéb", 2), "a");
        assert_eq!(truncate_utf8("short", 100), "short");
    }
}
