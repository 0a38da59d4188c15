//! # Registry
//!
//! Process-wide record of which bytes currently carry a hook, so two hooks never patch the same code

use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::HookError;

lazy_static! {
    /// Patched ranges, keyed by start, mapped to their end
    static ref HOOKED: Mutex<BTreeMap<usize, usize>> = Mutex::new(BTreeMap::new());
}

/// Locks the registry. Insertions and removals are single operations, so a poisoned map is still consistent.
fn hooked() -> MutexGuard<'static, BTreeMap<usize, usize>> {
    HOOKED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether any claimed range overlaps `range`.
///
/// Claims never overlap each other, so only the last claim starting before `range.end` can.
fn overlaps(hooked: &BTreeMap<usize, usize>, range: &Range<usize>) -> bool {
    hooked
        .range(..range.end)
        .next_back()
        .is_some_and(|(_, end)| *end > range.start)
}

/// Exclusive ownership of a patched range, released on drop
#[derive(Debug)]
#[must_use = "the range is released as soon as the claim is dropped"]
pub struct Claim(Range<usize>);

impl Claim {
    /// First claimed byte
    pub fn address(&self) -> usize {
        self.0.start
    }

    /// Every claimed byte
    pub fn range(&self) -> Range<usize> {
        self.0.clone()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        hooked().remove(&self.0.start);
    }
}

/// Claims `range` for a hook, failing with [`HookError::TargetInUse`] if any of it is already claimed
pub fn claim(range: Range<usize>) -> Result<Claim, HookError> {
    let mut hooked = hooked();
    if range.is_empty() || overlaps(&hooked, &range) {
        return Err(HookError::TargetInUse(range.start));
    }
    hooked.insert(range.start, range.end);
    Ok(Claim(range))
}

/// Whether `address` lies inside the patched bytes of an attached hook
pub fn is_hooked(address: usize) -> bool {
    overlaps(&hooked(), &(address..address.saturating_add(1)))
}
