//! # Host
//!
//! The services a hook needs from its environment: executable memory, page protection,
//! and a chance to stop other threads while live code is rewritten

use std::fmt;
use std::ptr::NonNull;

use region::Protection;

use crate::alloc::{self, AllocError, CodeBlock};

/// A sized run of bytes in the address space, usually the patched head of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRegion {
    /// First byte
    base: NonNull<u8>,
    /// Number of bytes
    len: usize,
}

impl CodeRegion {
    /// Describes `len` bytes starting at `base`, or `None` if `base` is null.
    pub fn new(base: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(base).map(|base| Self { base, len })
    }

    /// Describes `len` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must not be null.
    pub unsafe fn new_unchecked(base: *mut u8, len: usize) -> Self {
        Self {
            base: NonNull::new_unchecked(base),
            len,
        }
    }

    /// First byte of the region
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Address of the first byte
    pub fn address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Number of bytes in the region
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Resumes whatever [`Host::suspend`] stopped, when dropped
#[derive(Default)]
#[must_use = "execution resumes as soon as the suspension is dropped"]
pub struct Suspension(Option<Box<dyn FnOnce()>>);

impl Suspension {
    /// A suspension that stopped nothing
    pub fn none() -> Self {
        Self(None)
    }

    /// A suspension that calls `resume` when dropped
    pub fn new(resume: impl FnOnce() + 'static) -> Self {
        Self(Some(Box::new(resume)))
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Suspension").field(&self.0.is_some()).finish()
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        if let Some(resume) = self.0.take() {
            resume();
        }
    }
}

/// Environment services used by [`InlineHook`](crate::InlineHook)
pub trait Host {
    /// Allocates `size` bytes of read-write-execute memory from which a `jmp rel32` can reach `origin`
    fn allocate(&self, origin: usize, size: usize) -> Result<CodeBlock, AllocError>;

    /// Sets the protection of `region` and returns the protection it had before.
    ///
    /// # Safety
    ///
    /// Lowering the protection of memory that is in use can crash the process.
    unsafe fn protect(
        &self,
        region: &CodeRegion,
        protection: Protection,
    ) -> Result<Protection, region::Error>;

    /// Called before live code is rewritten. Execution of the target by other threads must be
    /// impossible until the returned guard is dropped.
    ///
    /// The default stops nothing, leaving the caller responsible for exclusion.
    fn suspend(&self) -> Suspension {
        Suspension::none()
    }
}

impl<H: Host + ?Sized> Host for &H {
    fn allocate(&self, origin: usize, size: usize) -> Result<CodeBlock, AllocError> {
        (**self).allocate(origin, size)
    }

    unsafe fn protect(
        &self,
        region: &CodeRegion,
        protection: Protection,
    ) -> Result<Protection, region::Error> {
        (**self).protect(region, protection)
    }

    fn suspend(&self) -> Suspension {
        (**self).suspend()
    }
}

/// The running process, via the shared trampoline pool and the `region` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct System;

impl Host for System {
    fn allocate(&self, origin: usize, size: usize) -> Result<CodeBlock, AllocError> {
        alloc::allocate_near(origin, size)
    }

    unsafe fn protect(
        &self,
        region: &CodeRegion,
        protection: Protection,
    ) -> Result<Protection, region::Error> {
        let previous = region::query(region.as_ptr())?.protection();
        region::protect(region.as_ptr(), region.len(), protection)?;
        tracing::trace!(
            "Protection of {:x}+{} changed from {:?} to {:?}",
            region.address(),
            region.len(),
            previous,
            protection
        );
        Ok(previous)
    }
}
