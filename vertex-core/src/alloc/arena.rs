//! Monotonic bump allocator backed by a linked list of aligned chunks.
//! Grounded on `include/vertex/memory/arenaallocator.hh`.

use crate::error::{VertexError, VertexResult};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

struct Chunk {
    data: Vec<u8>,
    used: usize,
}

impl Chunk {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            used: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.used
    }
}

/// Bump allocator. Per-object destruction is not supported: callers must
/// only place trivially destructible or leak-tolerant data here.
pub struct Arena {
    chunks: Vec<Chunk>,
    default_chunk_size: usize,
}

impl Arena {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(default_chunk_size: usize) -> Self {
        Self {
            chunks: vec![Chunk::with_capacity(default_chunk_size)],
            default_chunk_size,
        }
    }

    /// Allocates `size` bytes aligned to `alignment` (must be a power of
    /// two) and returns a byte range `[offset, offset + size)` into the
    /// chunk that owns it, identified by `(chunk_index, offset)`.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> VertexResult<(usize, usize)> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(VertexError::InvalidParameter(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let last_index = self.chunks.len() - 1;
        {
            let chunk = &self.chunks[last_index];
            let aligned_offset = align_up(chunk.used, alignment);
            if aligned_offset + size <= chunk.data.len() {
                let chunk = &mut self.chunks[last_index];
                chunk.used = aligned_offset + size;
                return Ok((last_index, aligned_offset));
            }
        }

        // Current chunk doesn't fit; grow.
        let new_chunk_size = std::cmp::max(self.default_chunk_size, size + alignment);
        self.chunks.push(Chunk::with_capacity(new_chunk_size));
        let new_index = self.chunks.len() - 1;
        let chunk = &mut self.chunks[new_index];
        let aligned_offset = align_up(0, alignment);
        if aligned_offset + size > chunk.data.len() {
            return Err(VertexError::IoFailed("arena chunk allocation failed".into()));
        }
        chunk.used = aligned_offset + size;
        Ok((new_index, aligned_offset))
    }

    pub fn bytes_mut(&mut self, chunk_index: usize, offset: usize, len: usize) -> &mut [u8] {
        &mut self.chunks[chunk_index].data[offset..offset + len]
    }

    pub fn bytes(&self, chunk_index: usize, offset: usize, len: usize) -> &[u8] {
        &self.chunks[chunk_index].data[offset..offset + len]
    }

    /// Zeros used bytes in every chunk; retains capacity.
    pub fn reset(&mut self) {
        for chunk in &mut self.chunks {
            chunk.data[..chunk.used].fill(0);
            chunk.used = 0;
        }
    }

    /// Drops all but the first chunk.
    pub fn shrink_to_fit(&mut self) {
        self.chunks.truncate(1);
        self.chunks[0].used = 0;
    }

    /// Destroys all chunks, including the first.
    pub fn clear_all(&mut self) {
        self.chunks.clear();
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_used(&self) -> usize {
        self.chunks.iter().map(|c| c.used).sum()
    }

    pub fn total_capacity(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
