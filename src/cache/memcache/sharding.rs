//! Key to server assignment
//!
//! The key bytes are folded into a 32-bit checksum: big-endian 4-byte words
//! are XORed together while more than four bytes remain, then each
//! remaining byte is XORed in as a signed value. The server index is the
//! non-negative remainder of the checksum by the server count.

/// XOR-fold checksum of a backend key
pub fn checksum(key: &[u8]) -> i32 {
    let mut checksum = 0i32;
    let mut rest = key;
    while rest.len() > 4 {
        checksum ^= i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        rest = &rest[4..];
    }
    for &byte in rest {
        checksum ^= byte as i8 as i32;
    }
    checksum
}

/// Index of the server responsible for `key`
pub fn select_server(key: &[u8], servers: usize) -> usize {
    if servers <= 1 {
        return 0;
    }
    checksum(key).rem_euclid(servers as i32) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_keys_use_signed_bytes() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(&[0x01, 0x02]), 0x01 ^ 0x02);
        assert_eq!(checksum(&[0xff]), -1);
    }

    #[test]
    fn test_words_then_tail() {
        // Exactly four bytes are folded byte-wise, five bytes take one word.
        assert_eq!(checksum(&[0, 0, 1, 0]), 1);
        assert_eq!(checksum(&[0, 0, 1, 0, 3]), 0x100 ^ 3);
    }

    #[test]
    fn test_negative_checksum_selects_valid_index() {
        assert_eq!(select_server(&[0xff], 3), 2);
        assert_eq!(select_server(&[0xff], 1), 0);
    }

    proptest! {
        #[test]
        fn prop_selection_in_range_and_stable(key in proptest::collection::vec(any::<u8>(), 0..128), servers in 1usize..16) {
            let index = select_server(&key, servers);
            prop_assert!(index < servers);
            prop_assert_eq!(index, select_server(&key, servers));
        }
    }
}
