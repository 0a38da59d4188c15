//! Finds unmapped pages around an address, nearest first in each direction
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

/// Returns an iterator over free pages at or above `origin`.
pub fn after(origin: usize, range: Range<usize>) -> FreeRegions {
    FreeRegions::new(origin, range, Direction::After)
}

/// Returns an iterator over free pages below `origin`.
pub fn before(origin: usize, range: Range<usize>) -> FreeRegions {
    FreeRegions::new(origin, range, Direction::Before)
}

#[allow(clippy::missing_docs_in_private_items)]
/// Direction for the region search.
#[derive(Clone, Copy)]
enum Direction {
    Before,
    After,
}

/// An iterator yielding the base address of each free page found while walking away from an origin.
///
/// Stops at the first address outside `range`, or at the first query error other than
/// [`region::Error::UnmappedRegion`], which is yielded before stopping.
pub struct FreeRegions {
    /// Addresses the search may visit
    range: Range<usize>,
    /// Direction we're searching
    direction: Direction,
    /// Next page to query, `None` once exhausted
    current: Option<usize>,
}

impl FreeRegions {
    /// Creates a new iterator for free regions.
    fn new(origin: usize, range: Range<usize>, direction: Direction) -> Self {
        let page = region::page::size();
        let origin = origin - origin % page;
        let current = match direction {
            Direction::After => Some(origin),
            Direction::Before => origin.checked_sub(page),
        };
        Self {
            range,
            direction,
            current,
        }
    }

    /// Moves `current` to the page following `address` in the search direction.
    fn step_from(&mut self, address: usize, page: usize) {
        self.current = match self.direction {
            Direction::Before => address.checked_sub(page),
            Direction::After => address.checked_add(page),
        };
    }
}

impl Iterator for FreeRegions {
    type Item = Result<usize, region::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let page = region::page::size();

        while let Some(current) = self.current.filter(|c| *c > 0 && self.range.contains(c)) {
            match region::query(current as *const u8) {
                // Skip over the whole mapping in one go
                Ok(mapped) => {
                    let span = mapped.as_range();
                    self.current = match self.direction {
                        Direction::Before => span.start.checked_sub(page),
                        Direction::After => Some(span.end),
                    };
                }
                Err(region::Error::UnmappedRegion) => {
                    self.step_from(current, page);
                    return Some(Ok(current));
                }
                Err(error) => {
                    self.current = None;
                    return Some(Err(error));
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::{after, before};

    #[test]
    fn test_free_pages_are_unmapped_and_in_range() {
        let origin = test_free_pages_are_unmapped_and_in_range as *const () as usize;
        let page = region::page::size();
        let range = origin.saturating_sub(0x4000_0000)..origin.saturating_add(0x4000_0000);

        let found: Vec<usize> = after(origin, range.clone())
            .take(2)
            .chain(before(origin, range.clone()).take(2))
            .map(|r| r.unwrap())
            .collect();

        assert!(!found.is_empty());
        for address in found {
            assert_eq!(address % page, 0);
            assert!(range.contains(&address));
            assert!(matches!(
                region::query(address as *const u8),
                Err(region::Error::UnmappedRegion)
            ));
        }
    }

    #[test]
    fn test_empty_range_yields_nothing() {
        let origin = test_empty_range_yields_nothing as *const () as usize;
        assert!(after(origin, origin..origin).next().is_none());
        assert!(before(origin, origin..origin).next().is_none());
    }
}
