//! Allocates trampolines within jumping distance of the code they serve
//!
//! The pooling scheme follows detour-rs: https://github.com/darfink/detour-rs

use lazy_static::lazy_static;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

pub mod proximity;
pub mod search;

/// Errors that occur while allocating executable memory
#[derive(Debug, Error)]
pub enum AllocError {
    /// No free memory within reach of the requested origin
    #[error("no free memory within reach of the origin")]
    OutOfMemory,
    /// Mapping a pool failed
    #[error("cannot map memory: {0}")]
    Mmap(String),
    /// Querying the address space failed
    #[error("cannot query memory: {0}")]
    Region(#[from] region::Error),
}

/// A thread-safe memory pool for allocating chunks close to addresses.
pub struct TrampolinePool(Arc<Mutex<proximity::ProximityAllocator>>);

impl TrampolinePool {
    /// Creates a pool whose allocations lie within `max_distance` of their origin.
    pub fn new(max_distance: usize) -> Self {
        Self(Arc::new(Mutex::new(proximity::ProximityAllocator::new(
            max_distance,
        ))))
    }

    /// Allocates `size` bytes of read-, write- & executable memory close to `origin`.
    pub fn allocate(&self, origin: usize, size: usize) -> Result<CodeBlock, AllocError> {
        let data = lock(&self.0).allocate(origin, size)?;
        Ok(CodeBlock {
            allocator: self.0.clone(),
            data,
        })
    }
}

/// Locks the allocator, ignoring poisoning since every allocator operation leaves it consistent
fn lock(
    allocator: &Mutex<proximity::ProximityAllocator>,
) -> MutexGuard<'_, proximity::ProximityAllocator> {
    allocator.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An owned block of executable memory.
///
/// The block is freed exactly once, when it is dropped. Its contents are undefined until written.
pub struct CodeBlock {
    /// Proximity allocator the block came from
    allocator: Arc<Mutex<proximity::ProximityAllocator>>,
    /// Actual allocation where the executable code resides
    data: proximity::Allocation,
}

impl CodeBlock {
    /// Address of the first byte
    pub fn address(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

impl fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlock")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.data.len())
            .finish()
    }
}

impl Drop for CodeBlock {
    fn drop(&mut self) {
        // Release the associated memory map (if unique)
        lock(&self.allocator).release(&self.data);
    }
}

impl Deref for CodeBlock {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.deref()
    }
}

impl DerefMut for CodeBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.deref_mut()
    }
}

/// How far a trampoline may be placed from its target.
///
/// A little under 2 GiB so that every byte of a block stays within rel32 reach.
#[cfg(target_pointer_width = "64")]
pub const REACH: usize = 0x7fff_0000;
/// How far a trampoline may be placed from its target.
///
/// rel32 covers the whole 32-bit address space.
#[cfg(target_pointer_width = "32")]
pub const REACH: usize = usize::MAX;

lazy_static! {
    static ref POOL: TrampolinePool = TrampolinePool::new(REACH);
}

/// Allocates an executable block within [`REACH`] of `origin`
pub fn allocate_near(origin: usize, size: usize) -> Result<CodeBlock, AllocError> {
    POOL.allocate(origin, size)
}
