//! Chunked XXH3-64 checksums over section payloads.
//!
//! Sections are hashed in fixed-size slices of their uncompressed bytes so
//! a verifier can localize corruption to one chunk without re-reading the
//! whole section into a single hash state.

use xxhash_rust::xxh3::xxh3_64;

/// Default chunk size for section checksums (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// Hash `data` in `chunk_size` slices. Empty input yields no hashes.
pub fn chunk_hashes(data: &[u8], chunk_size: usize) -> Vec<u64> {
    assert!(chunk_size > 0, "chunk size must be nonzero");
    data.chunks(chunk_size).map(xxh3_64).collect()
}

/// Hash `data` in `chunk_size` slices, rendered as lowercase
/// zero-padded 16-hex-digit strings.
pub fn chunk_hashes_hex(data: &[u8], chunk_size: usize) -> Vec<String> {
    chunk_hashes(data, chunk_size)
        .into_iter()
        .map(|h| format!("{h:016x}"))
        .collect()
}

/// Compare two hash sequences, returning the index of the first mismatch.
///
/// A length difference reports the first index past the shorter sequence.
pub fn first_mismatch(have: &[u64], want: &[u64]) -> Option<usize> {
    if have.len() != want.len() {
        return Some(have.len().min(want.len()));
    }
    have.iter().zip(want).position(|(a, b)| a != b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_hashes() {
        assert!(chunk_hashes(&[], DEFAULT_CHUNK_SIZE).is_empty());
        assert!(chunk_hashes_hex(&[], 1024).is_empty());
    }

    #[test]
    fn chunk_count_follows_ceiling_division() {
        let data = vec![0xabu8; 2500];
        assert_eq!(chunk_hashes(&data, 1024).len(), 3);
        assert_eq!(chunk_hashes(&data, 2500).len(), 1);
        assert_eq!(chunk_hashes(&data, 2499).len(), 2);
    }

    #[test]
    fn hashes_are_a_function_of_bytes_and_chunking() {
        let data: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        let a = chunk_hashes(&data, 1024);
        let b = chunk_hashes(&data, 1024);
        assert_eq!(a, b);
        let c = chunk_hashes(&data, 512);
        assert_ne!(a.len(), c.len());
    }

    #[test]
    fn hex_rendering_is_sixteen_lowercase_digits() {
        let hex = chunk_hashes_hex(b"hello", 1024);
        assert_eq!(hex.len(), 1);
        assert_eq!(hex[0].len(), 16);
        assert!(hex[0].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn mismatch_localizes_flipped_byte() {
        let mut data = vec![7u8; 3000];
        let want = chunk_hashes(&data, 1024);
        data[2048] ^= 0xff;
        let have = chunk_hashes(&data, 1024);
        assert_eq!(first_mismatch(&have, &want), Some(2));
        assert_eq!(first_mismatch(&want, &want), None);
    }
}
