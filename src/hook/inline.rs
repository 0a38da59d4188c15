//! # Inline Hook
//!
//! This hook overwrites the head of a function with a `jmp` to a callback. The overwritten
//! instructions are kept in a trampoline, so the original function stays callable.
//!
//! Trampoline block layout:
//!
//! ```text
//! [ copied prologue | jmp target+len | relay (x86-64, far callbacks only) ]
//! ```

use std::fmt;
use std::slice;

use crate::alloc::CodeBlock;
use crate::code::{Architecture, Native, JMP_REL_LEN};
use crate::error::HookError;
use crate::host::{CodeRegion, Host, System};
use crate::patcher::byte::BytePatcher;
use crate::patcher::mem::{PermissionError, PermissionWrapper};
use crate::patcher::Patcher;
use crate::registry::{self, Claim};
use crate::scan::Prologue;

use super::settings::HookSettings;
use super::Function;

/// Everything owned while a hook is attached
struct Attachment {
    /// Copied prologue, jump back, and optional relay
    trampoline: CodeBlock,
    /// Bytes of the target overwritten by the patch
    patch_len: usize,
    /// Keeps other hooks off the target
    _claim: Claim,
}

/// Redirects calls of `target` to `callback`, both of type `F`.
///
/// A hook starts detached. [`InlineHook::attach`] and [`InlineHook::detach`] are its only state
/// transitions. Dropping an attached hook detaches it, and aborts the process if that fails.
///
/// # Threads
///
/// Rewriting the target is not atomic. Other threads must not execute the target during
/// `attach` or `detach`, unless the [`Host`] stops them in [`Host::suspend`].
pub struct InlineHook<F: Function, H: Host = System> {
    /// Function being intercepted
    target: F,
    /// Function calls are redirected to
    callback: F,
    /// Scan and relay settings
    settings: HookSettings,
    /// Memory and thread services
    host: H,
    /// `Some` while attached
    attached: Option<Attachment>,
}

impl<F: Function> InlineHook<F, System> {
    /// Binds a detached hook from `target` to `callback`, using the running process as host
    pub fn new(target: F, callback: F) -> Self {
        Self::with_host(target, callback, HookSettings::default(), System)
    }
}

impl<F: Function, H: Host> InlineHook<F, H> {
    /// Binds a detached hook from `target` to `callback`
    pub fn with_host(target: F, callback: F, settings: HookSettings, host: H) -> Self {
        Self {
            target,
            callback,
            settings,
            host,
            attached: None,
        }
    }

    /// The intercepted function. Once attached, calling it runs the callback.
    pub fn target(&self) -> F {
        self.target
    }

    /// The function calls are redirected to
    pub fn callback(&self) -> F {
        self.callback
    }

    /// The settings the hook was bound with
    pub fn settings(&self) -> &HookSettings {
        &self.settings
    }

    /// The host performing memory operations
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Whether the target is currently patched
    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }

    /// Bytes of the target overwritten, while attached
    pub fn patch_len(&self) -> Option<usize> {
        self.attached.as_ref().map(|a| a.patch_len)
    }

    /// The function behaving like the unpatched target, while attached
    pub fn trampoline(&self) -> Option<F> {
        self.attached
            .as_ref()
            .map(|a| unsafe { F::from_ptr(a.trampoline.address() as *const ()) })
    }

    /// Patches the target and returns the trampoline.
    ///
    /// Either everything succeeds, or the target is left unmodified and no memory is kept.
    ///
    /// # Safety
    ///
    /// - `target` must be executable code, readable for [`HookSettings::max_scan`] bytes or up to the end of its mapping
    /// - `callback` must have exactly the signature and calling convention of `target`
    /// - no other thread may execute the head of `target` while it is rewritten
    /// - the trampoline must not be called after the hook is detached
    pub unsafe fn attach(&mut self) -> Result<F, HookError> {
        if self.attached.is_some() {
            return Err(HookError::AlreadyAttached);
        }

        let target = self.target.to_ptr() as *mut u8;
        let address = target as usize;
        let callback = self.callback.to_ptr() as usize;
        // Inside another hook's patch the bytes are no longer the function's own
        if registry::is_hooked(address) {
            return Err(HookError::TargetInUse(address));
        }

        // Safety: the caller guarantees the target is readable up to the window
        let window = scan_window(target, self.settings.max_scan);
        let code = slice::from_raw_parts(target as *const u8, window);
        let prologue = Prologue::<Native>::scan(code, address, JMP_REL_LEN, window)?;
        let patch_len = prologue.len();
        let claim = registry::claim(address..address + patch_len)?;
        prologue.check_relocatable()?;

        let unreachable = HookError::Unreachable {
            from: address,
            to: callback,
        };
        let relay = match Native::jmp_to(address, callback) {
            Some(_) => None,
            None if self.settings.relay => Some(Native::relay(callback).ok_or(unreachable)?),
            None => return Err(unreachable),
        };

        let size = patch_len + JMP_REL_LEN + relay.as_ref().map_or(0, Vec::len);
        let mut trampoline = self.host.allocate(address, size)?;
        let base = trampoline.address();
        tracing::debug!(
            "Trampoline for {:x} at {:x} ({} bytes)",
            address,
            base,
            size
        );

        trampoline[..patch_len].copy_from_slice(&code[..patch_len]);
        let resume = Native::jmp_to(base + patch_len, address + patch_len).ok_or(
            HookError::Unreachable {
                from: base + patch_len,
                to: address + patch_len,
            },
        )?;
        trampoline[patch_len..patch_len + JMP_REL_LEN].copy_from_slice(&resume);

        let entry = match &relay {
            None => Native::jmp_to(address, callback),
            Some(relay) => {
                let at = patch_len + JMP_REL_LEN;
                trampoline[at..].copy_from_slice(relay);
                Native::jmp_to(address, base + at)
            }
        }
        .ok_or(HookError::Unreachable {
            from: address,
            to: callback,
        })?;

        // Safety: function pointers are never null
        let region = CodeRegion::new_unchecked(target, patch_len);
        {
            let _suspended = self.host.suspend();
            let writer = PermissionWrapper::new(BytePatcher::new(), &self.host);
            match writer.patch(&region, &entry) {
                Ok(()) => {}
                Err(PermissionError::Restore {
                    address,
                    previous,
                    source,
                }) => {
                    // The jump is live but the region is still writable, so take it back out
                    let _ = BytePatcher::new().patch(&region, &trampoline[..patch_len]);
                    match self.host.protect(&region, previous) {
                        Ok(_) => tracing::warn!(
                            "Rolled back hook at {:x} after a failed protection restore: {}",
                            address,
                            source
                        ),
                        Err(e) => tracing::warn!(
                            "Rolled back hook at {:x}, region left writable: {}",
                            address,
                            e
                        ),
                    }
                    return Err(HookError::ProtectionFailed { address, source });
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.attached = Some(Attachment {
            trampoline,
            patch_len,
            _claim: claim,
        });

        tracing::info!(
            "Attached hook {:x} -> {:x}, {} bytes patched, original at {:x}",
            address,
            callback,
            patch_len,
            base
        );

        Ok(F::from_ptr(base as *const ()))
    }

    /// Writes the original bytes back over the target and frees the trampoline.
    ///
    /// On failure the hook stays attached and the target may be in either state. Treat it as fatal.
    ///
    /// # Safety
    ///
    /// - no other thread may execute the head of `target` while it is rewritten
    /// - nothing may be executing, or about to return into, the trampoline
    pub unsafe fn detach(&mut self) -> Result<(), HookError> {
        let attachment = self.attached.as_ref().ok_or(HookError::NotAttached)?;
        let target = self.target.to_ptr() as *mut u8;
        let patch_len = attachment.patch_len;

        // Safety: function pointers are never null
        let region = CodeRegion::new_unchecked(target, patch_len);
        {
            let _suspended = self.host.suspend();
            PermissionWrapper::new(BytePatcher::new(), &self.host)
                .patch(&region, &attachment.trampoline[..patch_len])
                .map_err(|e| {
                    tracing::error!("Cannot detach hook at {:x}: {}", target as usize, e);
                    HookError::from(e)
                })?;
        }

        // Frees the trampoline and releases the address
        self.attached = None;

        tracing::info!("Detached hook at {:x}", target as usize);
        Ok(())
    }
}

/// Bytes readable from `target`, capped at `max_scan`
fn scan_window(target: *const u8, max_scan: usize) -> usize {
    match region::query(target) {
        Ok(mapped) => max_scan.min(mapped.as_range().end.saturating_sub(target as usize)),
        Err(e) => {
            tracing::debug!("Cannot query {:x}: {}", target as usize, e);
            0
        }
    }
}

impl<F: Function, H: Host> fmt::Debug for InlineHook<F, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineHook")
            .field("target", &self.target.to_ptr())
            .field("callback", &self.callback.to_ptr())
            .field("settings", &self.settings)
            .field("patch_len", &self.patch_len())
            .field(
                "trampoline",
                &self.attached.as_ref().map(|a| &a.trampoline),
            )
            .finish()
    }
}

impl<F: Function, H: Host> Drop for InlineHook<F, H> {
    fn drop(&mut self) {
        if self.attached.is_none() {
            return;
        }

        // Safety: attach succeeded, so the target is patchable code
        if let Err(e) = unsafe { self.detach() } {
            // Running on with a half-restored function is worse than stopping
            tracing::error!(
                "Dropped hook at {:x} cannot be detached, aborting: {}",
                self.target.to_ptr() as usize,
                e
            );
            std::process::abort();
        }
    }
}
