//! Cache key and caller identity derivation

use unicode_normalization::UnicodeNormalization;

const KEY_HEX_LEN: usize = 32;

/// Stable key for a piece of content when the caller did not supply an id.
/// NFKC-normalized, whitespace-collapsed and lowercased before hashing.
pub fn content_key(text: &str) -> String {
    let normalized: String = text.nfkc().collect();
    let collapsed = normalized
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let hash = blake3::hash(collapsed.as_bytes());
    hash.to_hex()[..KEY_HEX_LEN].to_string()
}

/// Phase 1 results are shared by every viewer of the content
pub fn phase1_key(content_id: &str) -> String {
    format!("p1:{}", content_id)
}

/// Phase 2 results are scoped to the requesting user. The user id is
/// length-prefixed so no (user, content) pair can spell another pair's key.
pub fn phase2_key(user_id: &str, content_id: &str) -> String {
    format!("p2:{}:{}:{}", user_id.len(), user_id, content_id)
}

/// One-way fingerprint for credentials so raw secrets are never used as map keys
pub fn fingerprint(secret: &str) -> String {
    let hash = blake3::hash(secret.trim().as_bytes());
    hash.to_hex()[..16].to_string()
}
