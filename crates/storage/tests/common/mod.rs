use bytes::Bytes;
use larder_core::ChunkHash;

/// Deterministic pseudo-random bytes; the same seed gives the same output.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // LCG
    for chunk in data.chunks_mut(8) {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let bytes = state.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }

    Bytes::from(data)
}

/// A chunk blob and the key it is stored under.
#[allow(dead_code)]
pub fn chunk_blob(seed: u64, len: usize) -> (String, Bytes) {
    let data = seeded_bytes(seed, len);
    let key = ChunkHash::compute(&data).to_object_key();
    (key, data)
}
