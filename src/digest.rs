//! Wire constants and the content digest shared by server and client.

use sha1::{Digest, Sha1};

/// Size of every request payload. Framing is purely by size.
pub const PAYLOAD_SIZE: usize = 8000;

/// Size of every response: a SHA-1 digest as lowercase hex.
pub const DIGEST_LEN: usize = 40;

/// Compute the SHA-1 of `data` as 40 lowercase hex characters.
///
/// Leading zero bytes of the hash are kept, so the result is always
/// exactly [`DIGEST_LEN`] characters long.
pub fn digest_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        assert_eq!(
            digest_hex(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_fixed_length_lowercase() {
        for fill in [0u8, 1, 0x7f, 0xff] {
            let payload = vec![fill; PAYLOAD_SIZE];
            let hex = digest_hex(&payload);
            assert_eq!(hex.len(), DIGEST_LEN);
            assert!(hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        }
    }

    #[test]
    fn test_deterministic_and_distinct() {
        let mut a = vec![0u8; PAYLOAD_SIZE];
        let b = a.clone();
        assert_eq!(digest_hex(&a), digest_hex(&b));

        a[PAYLOAD_SIZE - 1] = 1;
        assert_ne!(digest_hex(&a), digest_hex(&b));
    }
}
