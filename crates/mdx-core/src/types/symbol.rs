//! Fixed-size symbol utilities for shared-memory compatibility.
//!
//! Symbol records, wire messages and book metadata carry symbols as
//! `[u8; SYMBOL_LEN]`, null-padded.

/// Length of the fixed symbol buffer.
pub const SYMBOL_LEN: usize = 32;

/// Copy a symbol into a fixed null-padded buffer, truncating at `SYMBOL_LEN`.
#[inline]
pub fn symbol_to_bytes(s: &str) -> [u8; SYMBOL_LEN] {
    let mut buf = [0u8; SYMBOL_LEN];
    let len = s.len().min(SYMBOL_LEN);
    buf[..len].copy_from_slice(&s.as_bytes()[..len]);
    buf
}

/// Read a symbol back from a null-padded buffer of any width.
///
/// Invalid UTF-8 (which only a foreign writer could produce) reads as `""`.
#[inline]
pub fn symbol_from_bytes(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let buf = symbol_to_bytes("IF2406");
        assert_eq!(symbol_from_bytes(&buf), "IF2406");
    }

    #[test]
    fn empty_symbol() {
        assert_eq!(symbol_from_bytes(&symbol_to_bytes("")), "");
    }

    #[test]
    fn truncation() {
        let sym = "A".repeat(SYMBOL_LEN + 10);
        assert_eq!(symbol_from_bytes(&symbol_to_bytes(&sym)).len(), SYMBOL_LEN);
    }
}
