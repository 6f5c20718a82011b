//! Filesystem-safe names for state ids.
//!
//! Ids are arbitrary strings (`tap-gitlab-to-target-postgres`, `team/job:1`),
//! so anything outside `[A-Za-z0-9_-]` is percent-escaped byte by byte. The
//! encoding is reversible and never produces `.`, `..` or a path separator.
//!
//! Escaping can triple an id's length, so an encoded name longer than
//! [`MAX_ENCODED_NAME`] is replaced by `~<sha256 hex>`. Digest names are not
//! reversible; stores that use them keep the real id inside the object.

use crate::models::{Result, TidemarkError};
use sha2::{Digest, Sha256};

/// Longest encoded name used verbatim. Leaves room under the usual 255-byte
/// file name limit for suffixes and temp-file decoration.
pub const MAX_ENCODED_NAME: usize = 200;

const DIGEST_MARKER: char = '~';

/// Encode an id into a single path component.
pub fn encode_key(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// File name stem for an id: the encoded id, or a digest if that is too long.
pub fn storage_name(id: &str) -> String {
    let encoded = encode_key(id);
    if encoded.len() <= MAX_ENCODED_NAME {
        return encoded;
    }

    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    format!("{DIGEST_MARKER}{}", hex::encode(hasher.finalize()))
}

/// Whether a stem produced by [`storage_name`] is a digest.
///
/// `~` is always escaped by [`encode_key`], so encoded ids never start with it.
pub fn is_digest_name(stem: &str) -> bool {
    stem.starts_with(DIGEST_MARKER)
}

/// Decode a path component produced by [`encode_key`].
pub fn decode_key(name: &str) -> Result<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name
                .get(i + 1..i + 3)
                .ok_or_else(|| invalid(name))?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| invalid(name))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid(name))
}

fn invalid(name: &str) -> TidemarkError {
    TidemarkError::Internal(format!("malformed encoded state key: {name}"))
}
