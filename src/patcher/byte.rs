//! This module contains a byte patcher

use std::convert::Infallible;
use std::ptr;

use super::Patcher;
use crate::host::CodeRegion;

/// Patcher for patching writable memory with byte arrays.
/// This patcher never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytePatcher;

impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self
    }
}

unsafe impl Patcher for BytePatcher {
    type Error = Infallible;

    unsafe fn patch(&self, region: &CodeRegion, patch: &[u8]) -> Result<(), Self::Error> {
        debug_assert!(patch.len() <= region.len());
        // Safety: caller must ensure that `region` is writable for the full length of the patch
        ptr::copy_nonoverlapping(patch.as_ptr(), region.as_ptr(), patch.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::host::CodeRegion;
    use crate::patcher::byte::BytePatcher;
    use crate::patcher::Patcher;

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let mut data = vec![1u8, 2, 3, 4];
        let region = CodeRegion::new(data.as_mut_ptr(), data.len()).unwrap();

        unsafe { BytePatcher::new().patch(&region, &[4, 3, 2, 1]).unwrap() };
        assert_eq!(data, [4, 3, 2, 1]);

        unsafe { BytePatcher::new().patch(&region, &[1, 2, 3, 4]).unwrap() };
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// Tests a short patch to ensure we're not overwriting outside the patch area
    fn test_partial_patch() {
        let mut data = vec![1u8, 2, 3, 4];
        let region = CodeRegion::new(unsafe { data.as_mut_ptr().add(1) }, 3).unwrap();

        unsafe { BytePatcher::new().patch(&region, &[5, 5]).unwrap() };
        assert_eq!(data, [1, 5, 5, 4]);
    }
}
