//! # Patcher
//!
//! This module covers patchers, which overwrite regions of memory

pub mod byte;
pub mod mem;

use crate::host::CodeRegion;

/// Writes bytes over a region of memory
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must never write outside the region it is given
pub unsafe trait Patcher {
    /// Error type that can occur when patching. If patching always succeeds, use [`std::convert::Infallible`].
    type Error;

    /// Writes `patch` over the start of `region`.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads of its full length, and `patch` must not be longer than `region`.
    /// Whether `region` must already be writable depends on the patcher.
    unsafe fn patch(&self, region: &CodeRegion, patch: &[u8]) -> Result<(), Self::Error>;
}
