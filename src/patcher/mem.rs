//! This module contains a patcher which adjusts memory permissions to patch read-only code

use region::Protection;
use thiserror::Error;

use super::Patcher;
use crate::host::{CodeRegion, Host};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// The region could not be made writable. Nothing was written.
    #[error("cannot make {address:#x} writable: {source}")]
    Elevate {
        /// First byte of the region
        address: usize,
        /// Underlying protection error
        source: region::Error,
    },
    /// The patch was written but the previous protection could not be put back.
    /// The region is still writable.
    #[error("patched {address:#x} but cannot restore its protection: {source}")]
    Restore {
        /// First byte of the region
        address: usize,
        /// Protection the region had before the patch
        previous: Protection,
        /// Underlying protection error
        source: region::Error,
    },
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target region, triggering the patch, and then reverting the permissions.
///
/// # Safety
///
/// Protection changes are page-granular, so every page touched by the region briefly becomes writable and executable.
///
/// As always, casting a `&T` or `&mut T` to a `*mut u8` for use with `PermissionWrapper` can result in undefined behavior because rust assumes `&T` will never change and `&mut T` will only be changed via that reference.
/// The region **MUST** be memory not tracked by Rust, or ensured that reading from and writing to data tracked by Rust will not trigger undefined behavior.
pub struct PermissionWrapper<'h, P: Patcher, H: Host> {
    /// Underlying patcher.
    patcher: P,
    /// Host performing the protection changes
    host: &'h H,
}

impl<'h, P: Patcher, H: Host> PermissionWrapper<'h, P, H> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P, host: &'h H) -> Self {
        Self { patcher, host }
    }
}

unsafe impl<'h, P: Patcher, H: Host> Patcher for PermissionWrapper<'h, P, H> {
    type Error = PermissionError<P::Error>;

    unsafe fn patch(&self, region: &CodeRegion, patch: &[u8]) -> Result<(), Self::Error> {
        let address = region.address();
        let previous = self
            .host
            .protect(region, Protection::READ_WRITE_EXECUTE)
            .map_err(|source| PermissionError::Elevate { address, source })?;

        let written = self.patcher.patch(region, patch);

        // Put the protection back even if the patch failed
        let restored = self
            .host
            .protect(region, previous)
            .map_err(|source| PermissionError::Restore {
                address,
                previous,
                source,
            });

        written.map_err(PermissionError::CustomError)?;
        restored.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::slice;

    use region::Protection;

    use crate::alloc::{AllocError, CodeBlock};
    use crate::host::{CodeRegion, Host, System};
    use crate::patcher::byte::BytePatcher;
    use crate::patcher::mem::{PermissionError, PermissionWrapper};
    use crate::patcher::Patcher;

    /// Fails the `fail_at`th protection change
    struct Flaky {
        /// Protection changes so far
        calls: Cell<usize>,
        /// Which call fails, counting from 1
        fail_at: usize,
    }

    impl Host for Flaky {
        fn allocate(&self, origin: usize, size: usize) -> Result<CodeBlock, AllocError> {
            System.allocate(origin, size)
        }

        unsafe fn protect(
            &self,
            region: &CodeRegion,
            protection: Protection,
        ) -> Result<Protection, region::Error> {
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() == self.fail_at {
                return Err(region::Error::UnmappedRegion);
            }
            System.protect(region, protection)
        }
    }

    /// Asserts every page overlapping `ptr..ptr + len` has `protection`
    fn assert_protection(ptr: *const u8, len: usize, protection: Protection) {
        for region in region::query_range(ptr, len).unwrap() {
            let region = region.unwrap();
            assert!(!region.is_guarded());
            assert_eq!(region.protection(), protection);
        }
    }

    #[test]
    /// Tests that read-only memory gets patched and its permissions are put back
    fn test_perms() {
        let mut page = region::alloc(region::page::size(), Protection::READ_WRITE).unwrap();
        let ptr = page.as_mut_ptr::<u8>();
        unsafe { slice::from_raw_parts_mut(ptr, 4) }.copy_from_slice(b"1234");
        unsafe { region::protect(ptr, 4, Protection::READ).unwrap() };

        // sanity check
        assert_protection(ptr, 4, Protection::READ);

        let wrapper = PermissionWrapper::new(BytePatcher::new(), &System);
        let region = CodeRegion::new(ptr, 4).unwrap();
        unsafe { wrapper.patch(&region, &[4, 3, 2, 1]).unwrap() };

        // make sure the data was actually changed
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [4, 3, 2, 1]);

        // make sure permissions reverted correctly after the patch
        assert_protection(ptr, 4, Protection::READ);
    }

    #[test]
    /// A failure to elevate leaves the memory untouched
    fn test_elevate_failure() {
        let mut data = vec![1u8, 2, 3, 4];
        let region = CodeRegion::new(data.as_mut_ptr(), data.len()).unwrap();
        let host = Flaky {
            calls: Cell::new(0),
            fail_at: 1,
        };

        let wrapper = PermissionWrapper::new(BytePatcher::new(), &host);
        let result = unsafe { wrapper.patch(&region, &[9, 9, 9, 9]) };

        assert!(matches!(result, Err(PermissionError::Elevate { .. })));
        assert_eq!(host.calls.get(), 1);
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// A failure to restore is reported after the write went through
    fn test_restore_failure() {
        let mut page = region::alloc(region::page::size(), Protection::READ_WRITE).unwrap();
        let ptr = page.as_mut_ptr::<u8>();
        let region = CodeRegion::new(ptr, 4).unwrap();
        let host = Flaky {
            calls: Cell::new(0),
            fail_at: 2,
        };

        let wrapper = PermissionWrapper::new(BytePatcher::new(), &host);
        let result = unsafe { wrapper.patch(&region, &[9, 9, 9, 9]) };

        assert!(matches!(result, Err(PermissionError::Restore { .. })));
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [9, 9, 9, 9]);
        assert_protection(ptr, 4, Protection::READ_WRITE_EXECUTE);
    }
}
