//! Shared helpers for buffer-based extraction.

/// If the end of `buffer` could be the start of `token`, return the length
/// of that partial suffix. Used to hold back output while a marker may still
/// be arriving split across chunks.
pub fn ends_with_partial_token(buffer: &str, token: &str) -> Option<usize> {
    let max = token.len().min(buffer.len());
    // Longest partial match wins; a full match is not "partial".
    for len in (1..=max).rev() {
        if len == token.len() {
            continue;
        }
        if buffer.ends_with(&token[..len]) {
            return Some(len);
        }
    }
    None
}
