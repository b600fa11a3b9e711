//! Content-defined chunking.
//!
//! Boundaries come from a gear rolling hash (FastCDC). After the minimum
//! size, a cut is taken where the hash has a run of zero bits under a mask.
//! The mask is stricter before the target size and looser after it, which
//! pulls chunk sizes towards the target. A cut is forced at the maximum size.
//!
//! Because a boundary depends only on the bytes just before it, an edit
//! only moves the boundaries near it. Chunks further along realign and
//! deduplicate against the previous version.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::chunk::Chunk;
use crate::{Error, Result};

/// Smallest permitted `min_size`. The gear hash only sees the last 64 bytes.
pub const MIN_CHUNK_SIZE_FLOOR: usize = 64;

/// Largest permitted `max_size`: 16 MiB.
pub const MAX_CHUNK_SIZE_CEILING: usize = 16 * 1024 * 1024;

pub const DEFAULT_MIN_SIZE: usize = 16 * 1024;
pub const DEFAULT_TARGET_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_SIZE: usize = 256 * 1024;

const fn splitmix64(state: u64) -> (u64, u64) {
    let state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    (state, z ^ (z >> 31))
}

const fn build_gear_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = 0x6c61_7264_6572_2d31; // "larder-1"
    let mut i = 0;
    while i < 256 {
        let (next, value) = splitmix64(state);
        state = next;
        table[i] = value;
        i += 1;
    }
    table
}

/// Per-byte random values mixed into the rolling hash.
///
/// Changing this table changes every chunk boundary, so it is fixed.
static GEAR: [u64; 256] = build_gear_table();

/// Mask with `bits` ones in the most significant positions.
const fn high_mask(bits: u32) -> u64 {
    if bits == 0 {
        0
    } else {
        u64::MAX << (64 - bits)
    }
}

/// Size bounds for the chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub min_size: usize,
    pub target_size: usize,
    pub max_size: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            target_size: DEFAULT_TARGET_SIZE,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

impl ChunkingParams {
    pub fn new(min_size: usize, target_size: usize, max_size: usize) -> Result<Self> {
        let params = Self {
            min_size,
            target_size,
            max_size,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_size < MIN_CHUNK_SIZE_FLOOR {
            return Err(Error::InvalidChunking(format!(
                "min_size {} is below {MIN_CHUNK_SIZE_FLOOR}",
                self.min_size
            )));
        }
        if !(self.min_size <= self.target_size && self.target_size <= self.max_size) {
            return Err(Error::InvalidChunking(format!(
                "expected min <= target <= max, got {} / {} / {}",
                self.min_size, self.target_size, self.max_size
            )));
        }
        if !self.target_size.is_power_of_two() {
            return Err(Error::InvalidChunking(format!(
                "target_size {} is not a power of two",
                self.target_size
            )));
        }
        if self.max_size > MAX_CHUNK_SIZE_CEILING {
            return Err(Error::InvalidChunking(format!(
                "max_size {} exceeds {MAX_CHUNK_SIZE_CEILING}",
                self.max_size
            )));
        }
        Ok(())
    }

    /// (strict, loose) masks, one bit either side of log2(target).
    fn masks(&self) -> (u64, u64) {
        let bits = self.target_size.trailing_zeros();
        (high_mask(bits + 1), high_mask(bits.saturating_sub(1)))
    }
}

/// Stateless boundary finder shared by the slice and streaming front ends.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    params: ChunkingParams,
    mask_s: u64,
    mask_l: u64,
}

impl Chunker {
    pub fn new(params: ChunkingParams) -> Result<Self> {
        params.validate()?;
        let (mask_s, mask_l) = params.masks();
        Ok(Self {
            params,
            mask_s,
            mask_l,
        })
    }

    pub fn params(&self) -> &ChunkingParams {
        &self.params
    }

    /// Length of the first chunk of `data`, if `data` is long enough to
    /// decide it. Returns `None` when more input could still move the cut.
    fn find_cut(&self, data: &[u8]) -> Option<usize> {
        let ChunkingParams {
            min_size,
            target_size,
            max_size,
        } = self.params;

        if data.len() <= min_size {
            return None;
        }

        let end = data.len().min(max_size);
        let normal = target_size.min(end);
        let mut hash = 0u64;
        let mut i = min_size;

        while i < normal {
            hash = (hash << 1).wrapping_add(GEAR[data[i] as usize]);
            if hash & self.mask_s == 0 {
                return Some(i + 1);
            }
            i += 1;
        }
        while i < end {
            hash = (hash << 1).wrapping_add(GEAR[data[i] as usize]);
            if hash & self.mask_l == 0 {
                return Some(i + 1);
            }
            i += 1;
        }

        (end == max_size).then_some(max_size)
    }

    /// Boundary offsets (exclusive chunk ends) for a complete buffer.
    pub fn boundaries(&self, data: &[u8]) -> Vec<usize> {
        let mut cuts = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let rest = &data[offset..];
            offset += self.find_cut(rest).unwrap_or(rest.len());
            cuts.push(offset);
        }
        cuts
    }

    /// Split a complete buffer into chunks.
    pub fn chunk_bytes(&self, data: &Bytes) -> Vec<Chunk> {
        let mut start = 0;
        self.boundaries(data)
            .into_iter()
            .map(|end| {
                let chunk = Chunk::new(data.slice(start..end));
                start = end;
                chunk
            })
            .collect()
    }

    pub fn stream(&self) -> StreamChunker {
        StreamChunker {
            chunker: *self,
            buffer: BytesMut::new(),
        }
    }
}

/// Incremental chunker for input that arrives in pieces.
///
/// Produces exactly the chunks [`Chunker::chunk_bytes`] would for the
/// concatenated input, however the input is split. At most `max_size`
/// bytes plus the latest piece are buffered.
#[derive(Debug)]
pub struct StreamChunker {
    chunker: Chunker,
    buffer: BytesMut,
}

impl StreamChunker {
    /// Feed more input, returning every chunk that is now final.
    pub fn push(&mut self, data: &[u8]) -> Vec<Chunk> {
        self.buffer.extend_from_slice(data);

        // Only scan once a cut is guaranteed, so each byte is hashed once.
        let mut out = Vec::new();
        while self.buffer.len() >= self.chunker.params.max_size {
            let cut = self
                .chunker
                .find_cut(&self.buffer)
                .unwrap_or(self.chunker.params.max_size);
            out.push(Chunk::new(self.buffer.split_to(cut).freeze()));
        }
        out
    }

    /// End of input: flush what remains.
    pub fn finish(mut self) -> Vec<Chunk> {
        let mut out = Vec::new();
        while !self.buffer.is_empty() {
            let cut = self
                .chunker
                .find_cut(&self.buffer)
                .unwrap_or(self.buffer.len());
            out.push(Chunk::new(self.buffer.split_to(cut).freeze()));
        }
        out
    }

    /// Bytes held back waiting for a boundary decision.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
