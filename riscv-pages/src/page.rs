// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Physical page frames and page sizes.
use core::fmt;

/// Shift from a physical address to its page frame number.
pub const PFN_SHIFT: u64 = 12;
const PFN_BITS: u64 = 44;
const PFN_MASK: u64 = (1 << PFN_BITS) - 1;

/// Start of DRAM on the platforms the monitor runs on. Page ownership is tracked from here up.
pub const DRAM_BASE: u64 = 0x8000_0000;

/// Number of entries in one level of a RISC-V page table.
pub const ENTRIES_PER_PAGE: u64 = 512;

#[repr(u64)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PageSize {
    Size4k = 4 * 1024,
    Size2M = 2 * 1024 * 1024,
    Size1G = 1024 * 1024 * 1024,
}

impl PageSize {
    /// Returns `val` divided by 4kB, rounded up.
    pub const fn num_4k_pages(val: u64) -> u64 {
        (val + PageSize::Size4k as u64 - 1) / (PageSize::Size4k as u64)
    }

    /// Returns the number of 4kB frames covered by a page of this size.
    pub const fn frames(&self) -> u64 {
        *self as u64 / PageSize::Size4k as u64
    }

    /// Returns the page size mapped by a leaf that covers `frames` 4kB frames.
    pub fn from_frames(frames: u64) -> Option<Self> {
        match frames {
            1 => Some(PageSize::Size4k),
            512 => Some(PageSize::Size2M),
            262144 => Some(PageSize::Size1G),
            _ => None,
        }
    }

    /// Checks if the given quantity is aligned to this page size.
    pub fn is_aligned(&self, val: u64) -> bool {
        (val & (*self as u64 - 1)) == 0
    }

    /// Rounds down the quantity to the nearest multiple of this page size.
    pub fn round_down(&self, val: u64) -> u64 {
        val & !(*self as u64 - 1)
    }
}

/// A 4kB physical page frame number.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Pfn(u64);

impl Pfn {
    /// Creates a `Pfn` from raw frame number bits, truncated to the architectural width.
    pub const fn new(bits: u64) -> Self {
        Self(bits & PFN_MASK)
    }

    /// Returns the frame that contains `addr`.
    pub const fn from_addr(addr: u64) -> Self {
        Self::new(addr >> PFN_SHIFT)
    }

    /// Returns the frame number.
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Returns the physical address of the first byte of the frame.
    pub const fn addr(&self) -> u64 {
        self.0 << PFN_SHIFT
    }

    /// Returns the frame `count` frames after this one, or `None` on overflow.
    pub fn checked_add(&self, count: u64) -> Option<Self> {
        let bits = self.0.checked_add(count)?;
        (bits <= PFN_MASK).then_some(Self(bits))
    }

    /// Returns true if `[self, self + count)` and `[other, other + other_count)` share a frame.
    pub fn overlaps(&self, count: u64, other: Pfn, other_count: u64) -> bool {
        let end = self.0.saturating_add(count);
        let other_end = other.0.saturating_add(other_count);
        self.0 < other_end && other.0 < end
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:0x{:x}", self.0)
    }
}
