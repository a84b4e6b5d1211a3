//! Backend-safe name sanitation.
//!
//! The backend accepts arbitrary unicode in entity names and then mishandles
//! it in enough downstream paths that names written by this layer are reduced
//! to ASCII first: decompose (NFKD) so accented characters leave a base
//! letter behind, then drop everything non-ASCII.

use unicode_normalization::UnicodeNormalization;

/// Reduce a candidate entity name to the ASCII subset the backend handles
/// reliably. "café" becomes "cafe"; characters with no ASCII decomposition
/// are dropped entirely, so the result can be empty.
pub fn backend_safe(input: &str) -> String {
    input.nfkd().filter(char::is_ascii).collect()
}
