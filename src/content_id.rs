//! Content-derived identifiers for images.
//!
//! A ContentId is the lowercase hex SHA-256 of the exact file bytes. It is
//! the join key between the vector index and the caption store: identical
//! bytes always map to the same id, regardless of path or mtime.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Hex length of a ContentId (SHA-256 → 32 bytes → 64 hex chars).
pub const CONTENT_ID_LEN: usize = 64;

/// Compute the ContentId for a byte slice.
pub fn content_id_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    bytes_to_hex(&hasher.finalize())
}

/// Compute the ContentId for a file, streaming in 1 MiB chunks.
pub fn content_id_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(bytes_to_hex(&hasher.finalize()))
}

/// Check whether a string is shaped like a ContentId (64 hex chars).
pub fn looks_like_content_id(s: &str) -> bool {
    s.len() == CONTENT_ID_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Render bytes as lowercase hex.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(char::from_digit((b >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((b & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

/// Parse a 64-char hex ContentId back into its 32 raw bytes.
/// Returns None for malformed input.
pub fn hex_to_bytes(s: &str) -> Option<[u8; 32]> {
    if s.len() != CONTENT_ID_LEN {
        return None;
    }
    let mut out = [0u8; 32];
    let bytes = s.as_bytes();
    for (i, chunk) in bytes.chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}
