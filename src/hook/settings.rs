//! Tunables for [`InlineHook`](super::inline::InlineHook)

use crate::code::{Architecture, Native, JMP_REL_LEN};

/// How far the scanner may look for instruction boundaries by default
pub const DEFAULT_MAX_SCAN: usize = 128;

/// Settings shared by every attach of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookSettings {
    /// Upper bound on how many bytes of the target are decoded.
    ///
    /// Keeps one huge instruction from forcing a patch far larger than needed.
    pub max_scan: usize,
    /// Whether a callback out of `jmp rel32` reach may be reached through an absolute jump
    /// placed in the trampoline block. Without it such hooks fail to attach.
    pub relay: bool,
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            max_scan: DEFAULT_MAX_SCAN,
            relay: true,
        }
    }
}

impl HookSettings {
    /// Sets [`HookSettings::max_scan`], never below what one patch plus one instruction needs
    pub fn with_max_scan(mut self, max_scan: usize) -> Self {
        self.max_scan = max_scan.max(JMP_REL_LEN + Native::MAX_INSTRUCTION_LEN - 1);
        self
    }

    /// Sets [`HookSettings::relay`]
    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }
}
