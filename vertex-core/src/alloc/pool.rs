//! Free-list allocator of fixed-size slots, backed by growable blocks.
//! Grounded on `include/vertex/memory/poolallocator.hh`.

use static_assertions::const_assert;

/// A `Pool` hands out fixed-size, `OBJECT_SIZE`-byte slots. `OBJECT_SIZE`
/// must be at least the size of a pointer (the free list is threaded
/// through the free slots themselves) and `BLOCK_OBJECTS` must be nonzero;
/// spec names both as compile-time constraints, so they're checked here at
/// compile time per instantiation rather than rejected at construction.
pub struct Pool<const OBJECT_SIZE: usize, const BLOCK_OBJECTS: usize> {
    blocks: Vec<Vec<u8>>,
    free_list: Vec<usize>, // global slot indices, across all blocks
    allocated: usize,
}

impl<const OBJECT_SIZE: usize, const BLOCK_OBJECTS: usize> Pool<OBJECT_SIZE, BLOCK_OBJECTS> {
    const_assert!(OBJECT_SIZE >= std::mem::size_of::<usize>());
    const_assert!(BLOCK_OBJECTS > 0);

    pub fn new() -> Self {
        let mut pool = Self {
            blocks: Vec::new(),
            free_list: Vec::new(),
            allocated: 0,
        };
        pool.push_block();
        pool
    }

    fn push_block(&mut self) {
        let block_index = self.blocks.len();
        self.blocks.push(vec![0u8; OBJECT_SIZE * BLOCK_OBJECTS]);
        let base = block_index * BLOCK_OBJECTS;
        for i in 0..BLOCK_OBJECTS {
            self.free_list.push(base + i);
        }
    }

    fn slot_mut(&mut self, global_index: usize) -> &mut [u8] {
        let block = global_index / BLOCK_OBJECTS;
        let within = global_index % BLOCK_OBJECTS;
        let start = within * OBJECT_SIZE;
        &mut self.blocks[block][start..start + OBJECT_SIZE]
    }

    /// Pops the head of the free list, creating a new block if empty.
    pub fn allocate(&mut self) -> usize {
        if self.free_list.is_empty() {
            self.push_block();
        }
        let index = self.free_list.pop().unwrap();
        self.allocated += 1;
        index
    }

    pub fn bytes_mut(&mut self, slot: usize) -> &mut [u8] {
        self.slot_mut(slot)
    }

    /// Pushes `slot` onto the free list. Double-free is unchecked, matching
    /// the original's contract.
    pub fn deallocate(&mut self, slot: usize) {
        self.free_list.push(slot);
        self.allocated = self.allocated.saturating_sub(1);
    }

    /// Rebuilds the free list across all existing blocks.
    pub fn reset(&mut self) {
        self.free_list.clear();
        for block_index in 0..self.blocks.len() {
            let base = block_index * BLOCK_OBJECTS;
            for i in 0..BLOCK_OBJECTS {
                self.free_list.push(base + i);
            }
        }
        self.allocated = 0;
    }

    /// Drops blocks beyond what's needed to hold `self.allocated` objects.
    pub fn shrink_to_fit(&mut self) {
        let blocks_needed = self.allocated.div_ceil(BLOCK_OBJECTS).max(1);
        self.blocks.truncate(blocks_needed);
        self.free_list.retain(|&slot| slot / BLOCK_OBJECTS < blocks_needed);
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated
    }
}

impl<const OBJECT_SIZE: usize, const BLOCK_OBJECTS: usize> Default for Pool<OBJECT_SIZE, BLOCK_OBJECTS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_deallocate_reuses_slots() {
        let mut pool = Pool::<16, 2>::new();
        let a = pool.allocate();
        let b = pool.allocate();
        assert_ne!(a, b);
        assert_eq!(pool.allocated_count(), 2);

        pool.deallocate(a);
        assert_eq!(pool.allocated_count(), 1);

        let c = pool.allocate();
        assert_eq!(c, a, "freed slot should be reused");
    }

    #[test]
    fn grows_a_new_block_when_exhausted() {
        let mut pool = Pool::<16, 2>::new();
        let _ = pool.allocate();
        let _ = pool.allocate();
        assert_eq!(pool.block_count(), 1);
        let _ = pool.allocate();
        assert_eq!(pool.block_count(), 2);
    }

    #[test]
    fn reset_rebuilds_free_list_across_all_blocks() {
        let mut pool = Pool::<16, 2>::new();
        let _ = pool.allocate();
        let _ = pool.allocate();
        let _ = pool.allocate(); // forces a second block
        assert_eq!(pool.allocated_count(), 3);

        pool.reset();
        assert_eq!(pool.allocated_count(), 0);
        // All 4 slots across both blocks should be allocatable again.
        for _ in 0..4 {
            let _ = pool.allocate();
        }
        assert_eq!(pool.allocated_count(), 4);
    }

    #[test]
    fn shrink_to_fit_drops_unneeded_blocks() {
        let mut pool = Pool::<16, 2>::new();
        let a = pool.allocate();
        let _b = pool.allocate();
        let _c = pool.allocate(); // second block now exists
        pool.deallocate(a);
        assert_eq!(pool.allocated_count(), 2);

        pool.shrink_to_fit();
        assert_eq!(pool.block_count(), 1);
    }
}
