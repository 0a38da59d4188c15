//! Pools of read-write-execute pages kept within a fixed distance of the code they serve
//!
//! Adapted from detour-rs: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};

use super::search;
use super::AllocError;

/// Defines the allocation type.
pub type Allocation = SliceBox<u8>;

/// A mapped run of RWX pages and how many of its allocations are alive
pub struct Pool {
    /// Sub-allocator over the mapping
    memory: SlicePool<u8>,
    /// Allocations handed out and not yet released
    live: usize,
}

impl Pool {
    /// Bytes covered by the mapping
    fn span(&self) -> Range<usize> {
        let lower = self.memory.as_ptr() as usize;
        lower..lower + self.memory.len()
    }
}

/// Every pool with live allocations, each one a mapped run of RWX pages
pub struct ProximityAllocator {
    /// Max distance between an origin and any byte of the memory handed out for it
    pub max_distance: usize,
    /// Memory pools used for allocations
    pub pools: Vec<Pool>,
}

impl ProximityAllocator {
    /// Creates an allocator without any pools
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pools: Vec::new(),
        }
    }

    /// Allocates `size` bytes no further than `max_distance` from `origin`.
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<Allocation, AllocError> {
        let range =
            origin.saturating_sub(self.max_distance)..origin.saturating_add(self.max_distance);

        if let Some(allocation) = self.allocate_from_pools(&range, size) {
            return Ok(allocation);
        }

        let pool = self.allocate_pool(&range, origin, size)?;
        let allocation = pool.alloc(size).ok_or(AllocError::OutOfMemory)?;
        tracing::debug!(
            "Mapped {:#x} byte trampoline pool at {:x} for {:x}",
            pool.len(),
            pool.as_ptr() as usize,
            origin
        );
        self.pools.push(Pool {
            memory: pool,
            live: 1,
        });
        Ok(allocation)
    }

    /// Marks `value` as released, forgetting its pool once nothing in it is alive.
    ///
    /// The mapping itself is unmapped once the last [`Allocation`] referring to it is dropped.
    pub fn release(&mut self, value: &Allocation) {
        let address = value.as_ptr() as usize;
        let Some(index) = self
            .pools
            .iter()
            .position(|pool| pool.span().contains(&address))
        else {
            tracing::warn!("Released allocation at {:x} has no pool", address);
            return;
        };

        let pool = &mut self.pools[index];
        pool.live = pool.live.saturating_sub(1);
        if pool.live == 0 {
            let span = self.pools.remove(index).span();
            tracing::debug!("Unmapping trampoline pool at {:x}", span.start);
        }
    }

    /// Tries every existing pool lying entirely inside `range`.
    fn allocate_from_pools(&mut self, range: &Range<usize>, size: usize) -> Option<Allocation> {
        self.pools
            .iter_mut()
            .filter(|pool| {
                let span = pool.span();
                range.contains(&span.start) && range.contains(&(span.end - 1))
            })
            .find_map(|pool| {
                let allocation = pool.memory.alloc(size)?;
                pool.live += 1;
                Some(allocation)
            })
    }

    /// Maps a new pool at the free page closest to `origin`.
    fn allocate_pool(
        &mut self,
        range: &Range<usize>,
        origin: usize,
        size: usize,
    ) -> Result<SlicePool<u8>, AllocError> {
        let page = region::page::size();
        let len = size.div_ceil(page).max(1) * page;

        // After first: macOS cannot map below the process image
        search::after(origin, range.clone())
            .chain(search::before(origin, range.clone()))
            .filter(|candidate| match candidate {
                Ok(address) => address
                    .checked_add(len - 1)
                    .is_some_and(|end| range.contains(&end)),
                Err(_) => true,
            })
            .find_map(|candidate| match candidate {
                Ok(address) => Self::map_fixed(address, len).ok().map(Ok),
                Err(error) => Some(Err(AllocError::Region(error))),
            })
            .unwrap_or(Err(AllocError::OutOfMemory))
    }

    /// Tries to map `len` bytes of RWX memory exactly at `address`.
    fn map_fixed(address: usize, len: usize) -> Result<SlicePool<u8>, AllocError> {
        mmap::MemoryMap::new(
            len,
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
                mmap::MapOption::MapAddr(address as *const u8),
            ],
        )
        .map_err(|e| match e {
            mmap::MapError::ErrNoMem => AllocError::OutOfMemory,
            e => AllocError::Mmap(e.to_string()),
        })
        .map(PoolMemory)
        .map(SlicePool::new)
    }
}

/// A memory map that `SlicePool` can carve up.
struct PoolMemory(mmap::MemoryMap);

impl AsRef<[u8]> for PoolMemory {
    fn as_ref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }
}

impl AsMut<[u8]> for PoolMemory {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

// SAFETY: the mapping is only reached through the pool, which hands out disjoint slices
unsafe impl Send for PoolMemory {}
unsafe impl Sync for PoolMemory {}

#[cfg(test)]
mod tests {
    use super::ProximityAllocator;

    #[test]
    fn test_allocations_stay_in_range() {
        let origin = test_allocations_stay_in_range as *const () as usize;
        let distance = 0x4000_0000;
        let mut allocator = ProximityAllocator::new(distance);

        let first = allocator.allocate(origin, 32).unwrap();
        let second = allocator.allocate(origin, 32).unwrap();

        for allocation in [&first, &second] {
            let start = allocation.as_ptr() as usize;
            assert_eq!(allocation.len(), 32);
            assert!(start.abs_diff(origin) < distance);
            assert!((start + 31).abs_diff(origin) < distance);
        }

        // both fit in the first page, so they share a pool
        assert_eq!(allocator.pools.len(), 1);
        assert_ne!(first.as_ptr(), second.as_ptr());
    }

    #[test]
    fn test_allocation_is_executable() {
        let origin = test_allocation_is_executable as *const () as usize;
        let mut allocator = ProximityAllocator::new(0x4000_0000);
        let allocation = allocator.allocate(origin, 16).unwrap();

        let protection = region::query(allocation.as_ptr()).unwrap().protection();
        assert_eq!(protection, region::Protection::READ_WRITE_EXECUTE);
    }

    #[test]
    fn test_empty_pool_is_forgotten() {
        let origin = test_empty_pool_is_forgotten as *const () as usize;
        let mut allocator = ProximityAllocator::new(0x4000_0000);

        let first = allocator.allocate(origin, 16).unwrap();
        let second = allocator.allocate(origin, 16).unwrap();
        assert_eq!(allocator.pools.len(), 1);
        assert_eq!(allocator.pools[0].live, 2);

        allocator.release(&first);
        drop(first);
        assert_eq!(allocator.pools.len(), 1);

        allocator.release(&second);
        drop(second);
        assert_eq!(allocator.pools.len(), 0);

        // a fresh pool is mapped on demand
        let _third = allocator.allocate(origin, 16).unwrap();
        assert_eq!(allocator.pools.len(), 1);
    }
}
