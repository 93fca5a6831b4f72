// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use riscv_pages::Pfn;

use crate::hpt::{HptArea, HptLevel, Result, PTE_SIZE};
use crate::pte::Pte;
#[cfg(feature = "reverse-map")]
use crate::reverse_map::ReverseMap;

/// Keeps track of which HPT entries map which frames so that a range of frames can be unmapped
/// before it becomes private.
pub trait MappingTracker {
    /// Records a valid leaf written at `pte_addr` mapping `page_count` frames.
    fn track(&mut self, pte_addr: u64, pte: Pte, page_count: u64) -> Result<()>;

    /// Forgets a leaf that is about to be overwritten.
    fn untrack(&mut self, pte_addr: u64, pte: Pte, page_count: u64);

    /// Discards all records and rebuilds them from the current content of `hpt`.
    fn rebuild(&mut self, hpt: &HptArea) -> Result<()>;

    /// Clears the valid bit of every leaf in `hpt` that maps a frame in `[start, start + num)`.
    fn unmap_range(&mut self, hpt: &mut HptArea, start: Pfn, num: u64) -> Result<()>;
}

/// Keeps no records and scans every level of the HPT area on unmap.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinearScan;

impl MappingTracker for LinearScan {
    fn track(&mut self, _pte_addr: u64, _pte: Pte, _page_count: u64) -> Result<()> {
        Ok(())
    }

    fn untrack(&mut self, _pte_addr: u64, _pte: Pte, _page_count: u64) {}

    fn rebuild(&mut self, _hpt: &HptArea) -> Result<()> {
        Ok(())
    }

    fn unmap_range(&mut self, hpt: &mut HptArea, start: Pfn, num: u64) -> Result<()> {
        for level in HptLevel::ALL {
            let region = hpt.layout().region(level);
            for addr in region.step_by(PTE_SIZE as usize) {
                let pte = hpt.read(addr)?;
                if pte.valid_leaf() && pte.pfn().overlaps(level.page_span(), start, num) {
                    hpt.write(addr, pte.invalidated())?;
                }
            }
        }
        Ok(())
    }
}

/// The tracker in use: a linear scan until a reverse map is installed.
pub enum Unmapper {
    LinearScan(LinearScan),
    #[cfg(feature = "reverse-map")]
    ReverseMap(ReverseMap),
}

impl Unmapper {
    /// Returns true if the reverse map is installed.
    pub fn has_reverse_map(&self) -> bool {
        !matches!(self, Unmapper::LinearScan(_))
    }
}

impl Default for Unmapper {
    fn default() -> Self {
        Unmapper::LinearScan(LinearScan)
    }
}

impl MappingTracker for Unmapper {
    fn track(&mut self, pte_addr: u64, pte: Pte, page_count: u64) -> Result<()> {
        match self {
            Unmapper::LinearScan(t) => t.track(pte_addr, pte, page_count),
            #[cfg(feature = "reverse-map")]
            Unmapper::ReverseMap(t) => t.track(pte_addr, pte, page_count),
        }
    }

    fn untrack(&mut self, pte_addr: u64, pte: Pte, page_count: u64) {
        match self {
            Unmapper::LinearScan(t) => t.untrack(pte_addr, pte, page_count),
            #[cfg(feature = "reverse-map")]
            Unmapper::ReverseMap(t) => t.untrack(pte_addr, pte, page_count),
        }
    }

    fn rebuild(&mut self, hpt: &HptArea) -> Result<()> {
        match self {
            Unmapper::LinearScan(t) => t.rebuild(hpt),
            #[cfg(feature = "reverse-map")]
            Unmapper::ReverseMap(t) => t.rebuild(hpt),
        }
    }

    fn unmap_range(&mut self, hpt: &mut HptArea, start: Pfn, num: u64) -> Result<()> {
        match self {
            Unmapper::LinearScan(t) => t.unmap_range(hpt, start, num),
            #[cfg(feature = "reverse-map")]
            Unmapper::ReverseMap(t) => t.unmap_range(hpt, start, num),
        }
    }
}
