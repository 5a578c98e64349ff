//! Command hashing for the build log.
//!
//! The build log records a 64-bit MurmurHash2 of each edge's final evaluated
//! command line; a changed command hash is one of the staleness conditions.
//! The hash function and seed are fixed by the on-disk log format and must
//! not change.

const SEED: u64 = 0xDECAFBADDECAFBAD;
const M: u64 = 0xc6a4a7935bd1e995;
const R: u32 = 47;

/// 64-bit MurmurHash2 (the "64A" variant), seeded for build log entries.
pub fn murmur_hash_64a(data: &[u8]) -> u64 {
    let mut h = SEED ^ (data.len() as u64).wrapping_mul(M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        for (i, &b) in tail.iter().enumerate() {
            h ^= (b as u64) << (8 * i);
        }
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// Hash of an evaluated command line, as recorded in the build log.
pub fn hash_command(command: &str) -> u64 {
    murmur_hash_64a(command.as_bytes())
}
