//! # Error
//!
//! Everything that can go wrong while attaching or detaching a hook

use std::convert::Infallible;

use thiserror::Error;

use crate::alloc::AllocError;
use crate::patcher::mem::PermissionError;

/// Errors reported by [`InlineHook`](crate::InlineHook)
#[derive(Debug, Error)]
pub enum HookError {
    /// `attach` was called on an attached hook
    #[error("hook is already attached")]
    AlreadyAttached,
    /// `detach` was called on a detached hook
    #[error("hook is not attached")]
    NotAttached,
    /// The trampoline could not be allocated. Nothing was modified.
    #[error("cannot allocate trampoline: {0}")]
    AllocationFailed(#[from] AllocError),
    /// Changing the protection of the target failed.
    ///
    /// On detach this leaves the target in an unknown state and should be treated as fatal.
    #[error("cannot change protection at {address:#x}: {source}")]
    ProtectionFailed {
        /// First byte of the region whose protection was being changed
        address: usize,
        /// Underlying protection error
        source: region::Error,
    },
    /// Fewer than `required` bytes of whole instructions could be decoded at the target
    #[error("only {found} of {required} bytes at {address:#x} decode to whole instructions")]
    ScanFailed {
        /// Target address
        address: usize,
        /// Bytes covered by whole instructions
        found: usize,
        /// Bytes needed for the patch
        required: usize,
    },
    /// The prologue holds an instruction whose meaning depends on where it lives
    #[error("instruction at {address:#x}+{offset} is position dependent and cannot be copied")]
    RelocationRequired {
        /// Target address
        address: usize,
        /// Offset of the offending instruction
        offset: usize,
    },
    /// The function ends before the patch does, so patching would overwrite whatever follows it
    #[error("function at {address:#x} ends after {len} bytes, inside the patch")]
    TargetTooSmall {
        /// Target address
        address: usize,
        /// Offset just past the terminating instruction
        len: usize,
    },
    /// No jump can be encoded from `from` to `to`
    #[error("no jump from {from:#x} can reach {to:#x}")]
    Unreachable {
        /// Where the jump would be written
        from: usize,
        /// Where the jump should land
        to: usize,
    },
    /// Another hook is already attached to this address
    #[error("{0:#x} is already hooked")]
    TargetInUse(usize),
}

impl From<PermissionError<Infallible>> for HookError {
    fn from(e: PermissionError<Infallible>) -> Self {
        match e {
            PermissionError::Elevate { address, source }
            | PermissionError::Restore {
                address, source, ..
            } => {
                Self::ProtectionFailed { address, source }
            }
            PermissionError::CustomError(never) => match never {},
        }
    }
}
