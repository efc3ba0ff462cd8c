//! Resource name canonicalization
//!
//! Names built from application data (slugs, backup names, timestamps) can
//! exceed the 63 character DNS-1035 label limit. Long names are truncated and
//! suffixed with a short content hash so the result stays deterministic.

use sha2::{Digest, Sha256};

/// Maximum length of a DNS-1035 label
pub const MAX_NAME_LEN: usize = 63;

const HASH_SUFFIX_LEN: usize = 6;
const PREFIX_LEN: usize = MAX_NAME_LEN - HASH_SUFFIX_LEN;

/// Fit `name` into a DNS label
///
/// Names of at most 63 characters are returned unchanged. Longer names keep
/// their first 57 characters followed by the first 6 hex digits of the
/// SHA-256 of the full name.
pub fn canonicalize(name: &str) -> String {
    if name.chars().count() <= MAX_NAME_LEN {
        return name.to_string();
    }

    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    let mut out: String = name.chars().take(PREFIX_LEN).collect();
    out.push_str(&digest[..HASH_SUFFIX_LEN]);
    out
}
