use sha2::{Digest, Sha256};

pub const DATA_LEN: usize = 128;
pub const TARGET_LEN: usize = 32;
pub const HASH_LEN: usize = 32;
pub const HEADER_LEN: usize = 80;

/// 32-bit word of `data` that carries the nonce (bytes 76..80).
pub const NONCE_WORD: usize = 19;
pub const NONCE_OFFSET: usize = NONCE_WORD * 4;

pub const TRANSFER_GRANULARITY: usize = 128;

/// Number of slices the 32-bit nonce space is cut into by the work generator.
pub const NSLICES: u64 = 128;
pub const QUANTUM: u64 = (1u64 << 32) / NSLICES;

pub const fn pad_to_granularity(len: usize) -> usize {
    len.div_ceil(TRANSFER_GRANULARITY) * TRANSFER_GRANULARITY
}

pub fn splice_nonce(data: &[u8; DATA_LEN], nonce: u32) -> [u8; DATA_LEN] {
    let mut out = *data;
    out[NONCE_OFFSET..NONCE_OFFSET + 4].copy_from_slice(&nonce.to_be_bytes());
    out
}

pub fn header_hash(data: &[u8; DATA_LEN], nonce: u32) -> [u8; HASH_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&data[..HEADER_LEN]);
    header[NONCE_OFFSET..NONCE_OFFSET + 4].copy_from_slice(&nonce.to_be_bytes());
    let first = Sha256::digest(header);
    Sha256::digest(first).into()
}

/// Digest is little-endian, target big-endian.
pub fn hash_meets_target(hash: &[u8; HASH_LEN], target: &[u8; TARGET_LEN]) -> bool {
    for (h, t) in hash.iter().rev().zip(target.iter()) {
        if h < t {
            return true;
        }
        if h > t {
            return false;
        }
    }
    true
}
