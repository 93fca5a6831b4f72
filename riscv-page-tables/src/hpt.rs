// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::ops::Range;

use page_tracking::PageTrackingError;
use riscv_pages::{PageSize, Pfn, ENTRIES_PER_PAGE};

use crate::pte::Pte;

/// Errors from validating or updating the hypervisor page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The bitmap or the HPT area has not been set up.
    NotInitialized,
    /// The bitmap and HPT area can only be set up once.
    AlreadyInitialized,
    /// The HPT area boundaries are unaligned or out of order.
    InvalidLayout,
    /// The address is outside the HPT area or not aligned to an entry.
    InvalidAddress(u64),
    /// The caller's page count doesn't match the level of the entry.
    InvalidPageCount { expected: u64, found: u64 },
    /// Writing the entry would break the HPT invariants.
    InvalidEntry(u64),
    /// The reverse map has no free node for every frame the entry covers.
    OutOfNodes,
    /// The memory given to the reverse map can't hold the list heads and at least one node.
    ReverseMapTooSmall,
    /// Entries can't be changed between the enable scan and the end of enabling.
    EnableInProgress,
    /// The guard was already enabled.
    AlreadyEnabled,
    /// Enabling was finished without a successful enable scan.
    EnableNotStarted,
    /// The guest-stage walk hit an invalid entry.
    UnmappedGuestAddress(u64),
    /// The guest-stage translation mode isn't supported.
    UnsupportedMode(u64),
    /// Classifying pages failed.
    Bitmap(PageTrackingError),
}

impl From<PageTrackingError> for Error {
    fn from(e: PageTrackingError) -> Self {
        Error::Bitmap(e)
    }
}

/// Holds the result of HPT operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Size of one page table entry in bytes.
pub const PTE_SIZE: u64 = 8;

/// The three levels of the hypervisor's page tables, each kept in its own sub-region of the HPT
/// area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HptLevel {
    Pgd,
    Pmd,
    Leaf,
}

impl HptLevel {
    pub const ALL: [HptLevel; 3] = [HptLevel::Pgd, HptLevel::Pmd, HptLevel::Leaf];

    /// Returns the number of 4kB frames a leaf entry at this level maps.
    pub const fn page_span(&self) -> u64 {
        match self {
            HptLevel::Pgd => ENTRIES_PER_PAGE * ENTRIES_PER_PAGE,
            HptLevel::Pmd => ENTRIES_PER_PAGE,
            HptLevel::Leaf => 1,
        }
    }

    /// Returns the level a non-leaf entry at this level points to.
    pub const fn next(&self) -> Option<HptLevel> {
        match self {
            HptLevel::Pgd => Some(HptLevel::Pmd),
            HptLevel::Pmd => Some(HptLevel::Leaf),
            HptLevel::Leaf => None,
        }
    }
}

/// Boundaries of the HPT area: `[base, pmd_start)` holds top-level tables, `[pmd_start,
/// pte_start)` mid-level tables and `[pte_start, end)` leaf tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HptLayout {
    base: u64,
    pmd_start: u64,
    pte_start: u64,
    end: u64,
}

impl HptLayout {
    /// Creates a layout, checking that each boundary is page aligned and each level non-empty.
    pub fn new(base: u64, size: u64, pmd_start: u64, pte_start: u64) -> Result<Self> {
        let end = base.checked_add(size).ok_or(Error::InvalidLayout)?;
        let aligned = [base, size, pmd_start, pte_start]
            .iter()
            .all(|a| PageSize::Size4k.is_aligned(*a));
        if !aligned || !(base < pmd_start && pmd_start < pte_start && pte_start < end) {
            return Err(Error::InvalidLayout);
        }
        Ok(Self {
            base,
            pmd_start,
            pte_start,
            end,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.end - self.base
    }

    /// Returns the address range holding the tables of `level`.
    pub fn region(&self, level: HptLevel) -> Range<u64> {
        match level {
            HptLevel::Pgd => self.base..self.pmd_start,
            HptLevel::Pmd => self.pmd_start..self.pte_start,
            HptLevel::Leaf => self.pte_start..self.end,
        }
    }

    /// Returns the level whose region contains `addr`.
    pub fn level_of(&self, addr: u64) -> Option<HptLevel> {
        HptLevel::ALL
            .into_iter()
            .find(|l| self.region(*l).contains(&addr))
    }

    /// Returns the number of frames a leaf at entry address `addr` maps.
    pub fn page_span(&self, addr: u64) -> Result<u64> {
        if addr % PTE_SIZE != 0 {
            return Err(Error::InvalidAddress(addr));
        }
        self.level_of(addr)
            .map(|l| l.page_span())
            .ok_or(Error::InvalidAddress(addr))
    }

    /// Returns true if the page at `pfn` lies inside the region of `level`.
    pub fn region_holds_page(&self, level: HptLevel, pfn: Pfn) -> bool {
        self.region(level).contains(&pfn.addr())
    }

    /// Returns true if `[addr, addr + len)` shares a byte with the HPT area.
    pub fn overlaps(&self, addr: u64, len: u64) -> bool {
        let end = addr.saturating_add(len);
        addr < self.end && self.base < end
    }
}

/// The hypervisor's page tables as seen by the monitor.
pub struct HptArea {
    layout: HptLayout,
    entries: &'static mut [u64],
}

impl HptArea {
    /// Wraps `entries`, which must be the memory backing `layout`.
    pub fn new(layout: HptLayout, entries: &'static mut [u64]) -> Result<Self> {
        if entries.len() as u64 * PTE_SIZE != layout.size() {
            return Err(Error::InvalidLayout);
        }
        Ok(Self { layout, entries })
    }

    pub fn layout(&self) -> &HptLayout {
        &self.layout
    }

    fn index(&self, addr: u64) -> Result<usize> {
        self.layout.page_span(addr)?;
        Ok(((addr - self.layout.base) / PTE_SIZE) as usize)
    }

    /// Reads the entry at physical address `addr`.
    pub fn read(&self, addr: u64) -> Result<Pte> {
        let index = self.index(addr)?;
        Ok(Pte::from_bits(self.entries[index]))
    }

    /// Overwrites the entry at physical address `addr`.
    pub fn write(&mut self, addr: u64, pte: Pte) -> Result<()> {
        let index = self.index(addr)?;
        self.entries[index] = pte.bits();
        Ok(())
    }

    /// Returns every entry of `level` together with its address.
    pub fn entries(&self, level: HptLevel) -> impl Iterator<Item = (u64, Pte)> + '_ {
        let region = self.layout.region(level);
        let first = ((region.start - self.layout.base) / PTE_SIZE) as usize;
        let last = ((region.end - self.layout.base) / PTE_SIZE) as usize;
        self.entries[first..last]
            .iter()
            .enumerate()
            .map(move |(i, bits)| (region.start + i as u64 * PTE_SIZE, Pte::from_bits(*bits)))
    }

    /// Returns every valid leaf entry with its address and the number of frames it maps.
    pub fn valid_leaves(&self) -> impl Iterator<Item = (u64, Pte, u64)> + '_ {
        HptLevel::ALL.into_iter().flat_map(move |level| {
            self.entries(level)
                .filter(|(_, pte)| pte.valid_leaf())
                .map(move |(addr, pte)| (addr, pte, level.page_span()))
        })
    }
}
