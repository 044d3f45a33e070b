//! Entry-name encoding handling.
//!
//! ZIP files made by Japanese and Chinese packing tools usually store entry
//! names in the local code page (Shift_JIS, GBK, Big5) without setting the
//! UTF-8 flag. The zip crate falls back to CP437 for those names, which turns
//! them into mojibake. We re-decode the raw bytes with the caller's encoding
//! using encoding_rs.

use encoding_rs::{Encoding, UTF_8};

use super::ArchiveError;

/// Look up an encoding by its WHATWG label (`shift_jis`, `gbk`, `utf-8`, ...).
///
/// An empty label means UTF-8.
pub fn resolve_label(label: &str) -> Result<&'static Encoding, ArchiveError> {
    let label = label.trim();
    if label.is_empty() {
        return Ok(UTF_8);
    }
    Encoding::for_label(label.as_bytes())
        .ok_or_else(|| ArchiveError::UnsupportedEncoding(label.to_string()))
}

/// Decode an entry name into its stored path.
///
/// `decoded_by_zip` is the name as the zip crate produced it. When it is
/// byte-identical to `raw`, the name was either flagged UTF-8 or plain ASCII
/// and is used as-is. Otherwise the raw bytes are decoded with `encoding`,
/// replacing malformed sequences.
pub fn decode_entry_name(raw: &[u8], decoded_by_zip: &str, encoding: &'static Encoding) -> String {
    if decoded_by_zip.as_bytes() == raw {
        return decoded_by_zip.to_string();
    }
    let (name, _had_errors) = encoding.decode_without_bom_handling(raw);
    name.into_owned()
}
