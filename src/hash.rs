use twox_hash::{XxHash32, XxHash64};

/// The index hash of a span of bytes
///
/// Only a hint: equal hashes must always be confirmed by comparing the bytes.
pub fn block_hash(data: &[u8]) -> u32 {
    XxHash32::oneshot(0, data)
}

/// A wider hash, used to group identical blocks across a whole batch
pub fn identity_hash(data: &[u8]) -> u64 {
    XxHash64::oneshot(0, data)
}

pub fn is_blank(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_depend_on_content() {
        assert_eq!(block_hash(b"abcd"), block_hash(b"abcd"));
        assert_ne!(block_hash(b"abcd"), block_hash(b"abce"));
        assert_ne!(identity_hash(b"abcd"), identity_hash(b"abcd\0"));
    }

    #[test]
    fn blank_blocks() {
        assert!(is_blank(&[0; 64]));
        assert!(is_blank(&[]));
        assert!(!is_blank(b"\0\0\x01"));
    }
}
