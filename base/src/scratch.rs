//! Bump allocation for per-frame and per-job temporaries.

use bumpalo::Bump;

/// Stack-style group allocator: allocations live until the next `reset`,
/// which frees everything in one sweep. Intended to be thread-local or
/// owned by a single frame structure.
pub struct ScratchArena {
    bump: Bump,
}

impl ScratchArena {
    pub fn new() -> ScratchArena {
        ScratchArena { bump: Bump::new() }
    }

    pub fn with_capacity(bytes: usize) -> ScratchArena {
        ScratchArena { bump: Bump::with_capacity(bytes) }
    }

    pub fn alloc<T>(&self, value: T) -> &mut T {
        self.bump.alloc(value)
    }

    pub fn alloc_str(&self, value: &str) -> &str {
        self.bump.alloc_str(value)
    }

    pub fn alloc_slice_copy<T: Copy>(&self, values: &[T]) -> &mut [T] {
        self.bump.alloc_slice_copy(values)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }

    /// Frees every allocation made since the previous reset.
    pub fn reset(&mut self) {
        self.bump.reset();
    }
}

impl Default for ScratchArena {
    fn default() -> ScratchArena {
        ScratchArena::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_frees_in_one_sweep() {
        let mut arena = ScratchArena::new();
        for index in 0..64 {
            let value = arena.alloc(index);
            assert_eq!(*value, index);
        }
        let used = arena.allocated_bytes();
        assert!(used >= 64 * std::mem::size_of::<i32>());

        arena.reset();
        let value = arena.alloc(17u64);
        assert_eq!(*value, 17);
    }
}
