// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use page_tracking::PageBitmap;
use riscv_pages::Pfn;

use crate::hpt::{Error, HptArea, HptLayout, HptLevel, Result};
use crate::pte::Pte;
#[cfg(feature = "reverse-map")]
use crate::reverse_map::ReverseMap;
use crate::tracker::{LinearScan, MappingTracker, Unmapper};

/// Progress of turning on HPT validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardState {
    /// Entries are written through unchecked.
    Disabled,
    /// The existing tables passed the enable scan; waiting for TVM to be armed on every hart.
    Arming,
    /// Every entry write is validated and tracked.
    Enabled,
}

/// Owns the page classification bitmap and the hypervisor page tables, and makes sure the
/// hypervisor can never map a private page.
///
/// All methods expect the caller to hold the page-state lock that wraps the guard.
pub struct HptGuard {
    bitmap: PageBitmap,
    hpt: Option<HptArea>,
    tracker: Unmapper,
    state: GuardState,
}

impl HptGuard {
    pub const fn new() -> Self {
        Self {
            bitmap: PageBitmap::new(),
            hpt: None,
            tracker: Unmapper::LinearScan(LinearScan),
            state: GuardState::Disabled,
        }
    }

    /// Hands the guard its bitmap memory and the HPT area. Can only be done once.
    pub fn init(&mut self, bitmap_mem: &'static mut [u8], hpt: HptArea) -> Result<()> {
        if self.is_initialized() {
            return Err(Error::AlreadyInitialized);
        }
        self.bitmap.init(bitmap_mem);
        self.hpt = Some(hpt);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.bitmap.is_initialized() && self.hpt.is_some()
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    pub fn bitmap(&self) -> &PageBitmap {
        &self.bitmap
    }

    pub fn layout(&self) -> Result<HptLayout> {
        self.hpt
            .as_ref()
            .map(|h| *h.layout())
            .ok_or(Error::NotInitialized)
    }

    /// Returns the tracked frame window, which sizes the reverse map's list heads.
    pub fn tracked_pfns(&self) -> Result<(Pfn, u64)> {
        Ok(self.bitmap.tracked_pfns()?)
    }

    /// Switches unmapping to `map`. Only possible after `init` and before enabling.
    #[cfg(feature = "reverse-map")]
    pub fn install_reverse_map(&mut self, map: ReverseMap) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        match self.state {
            GuardState::Disabled => (),
            GuardState::Arming => return Err(Error::EnableInProgress),
            GuardState::Enabled => return Err(Error::AlreadyEnabled),
        }
        if self.tracker.has_reverse_map() {
            return Err(Error::AlreadyInitialized);
        }
        self.tracker = Unmapper::ReverseMap(map);
        Ok(())
    }

    /// Returns true if the reverse map tracks mappings.
    pub fn has_reverse_map(&self) -> bool {
        self.tracker.has_reverse_map()
    }

    /// Returns the number of frames a leaf at `addr` maps.
    pub fn page_span(&self, addr: u64) -> Result<u64> {
        self.layout()?.page_span(addr)
    }

    /// Reads the entry at `addr`.
    pub fn read_entry(&self, addr: u64) -> Result<Pte> {
        self.hpt.as_ref().ok_or(Error::NotInitialized)?.read(addr)
    }

    /// Returns true if any tracked frame in `[pfn, pfn + count)` is private. Frames outside the
    /// tracked window (MMIO, memory below DRAM) are never private.
    pub fn maps_private(&self, pfn: Pfn, count: u64) -> Result<bool> {
        let (window_start, frames) = self.bitmap.tracked_pfns()?;
        let start = pfn.bits().max(window_start.bits());
        let end = pfn
            .bits()
            .saturating_add(count)
            .min(window_start.bits() + frames);
        if start >= end {
            return Ok(false);
        }
        Ok(self.bitmap.contains_private(Pfn::new(start), end - start)?)
    }

    // Checks `pte`, about to be written at `addr` in the `level` region, against the HPT
    // invariants.
    fn check_entry(
        &self,
        layout: &HptLayout,
        level: HptLevel,
        addr: u64,
        pte: Pte,
    ) -> Result<()> {
        if !pte.valid() {
            return Ok(());
        }
        if pte.leaf() {
            if self.maps_private(pte.pfn(), level.page_span())? {
                return Err(Error::InvalidEntry(addr));
            }
            return Ok(());
        }
        match level.next() {
            Some(next) if layout.region_holds_page(next, pte.pfn()) => Ok(()),
            _ => Err(Error::InvalidEntry(addr)),
        }
    }

    /// Checks whether `validate_and_set` would accept the write, without writing.
    pub fn validate(&self, addr: u64, pte: Pte, page_count: u64) -> Result<()> {
        let layout = self.layout()?;
        let span = layout.page_span(addr)?;
        match self.state {
            GuardState::Disabled => Ok(()),
            GuardState::Arming => Err(Error::EnableInProgress),
            GuardState::Enabled => {
                if page_count != span {
                    return Err(Error::InvalidPageCount {
                        expected: span,
                        found: page_count,
                    });
                }
                let level = layout.level_of(addr).ok_or(Error::InvalidAddress(addr))?;
                self.check_entry(&layout, level, addr, pte)
            }
        }
    }

    // Writes `new` at `addr`, moving the tracking records from the old entry to the new one when
    // enabled. Restores the old entry if the new one can't be tracked.
    fn replace(&mut self, addr: u64, new: Pte) -> Result<Pte> {
        let enabled = self.state == GuardState::Enabled;
        let hpt = self.hpt.as_mut().ok_or(Error::NotInitialized)?;
        let span = hpt.layout().page_span(addr)?;
        let old = hpt.read(addr)?;
        if !enabled {
            hpt.write(addr, new)?;
            return Ok(old);
        }

        if old.valid_leaf() {
            self.tracker.untrack(addr, old, span);
        }
        hpt.write(addr, new)?;
        if new.valid_leaf() {
            if let Err(e) = self.tracker.track(addr, new, span) {
                hpt.write(addr, old)?;
                if old.valid_leaf() {
                    self.tracker.track(addr, old, span)?;
                }
                return Err(e);
            }
        }
        Ok(old)
    }

    /// Validates and writes one entry. Returns the entry that was replaced.
    pub fn validate_and_set(&mut self, addr: u64, pte: Pte, page_count: u64) -> Result<Pte> {
        self.validate(addr, pte, page_count)?;
        self.replace(addr, pte)
    }

    /// Puts back an entry replaced earlier in the same locked operation, skipping validation.
    pub fn restore_entry(&mut self, addr: u64, old: Pte) -> Result<()> {
        self.replace(addr, old).map(|_| ())
    }

    /// Checks the top and mid-level entries of the HPT area as a write would be checked and
    /// starts enabling. Leaf-level entries written before enabling are trusted.
    pub fn begin_enable(&mut self) -> Result<()> {
        let layout = self.layout()?;
        match self.state {
            GuardState::Disabled => (),
            GuardState::Arming => return Err(Error::EnableInProgress),
            GuardState::Enabled => return Err(Error::AlreadyEnabled),
        }
        let hpt = self.hpt.as_ref().ok_or(Error::NotInitialized)?;
        for level in [HptLevel::Pgd, HptLevel::Pmd] {
            for (addr, pte) in hpt.entries(level) {
                self.check_entry(&layout, level, addr, pte)?;
            }
        }
        self.state = GuardState::Arming;
        Ok(())
    }

    /// Rebuilds the mapping records and turns validation on.
    pub fn finish_enable(&mut self) -> Result<()> {
        if self.state != GuardState::Arming {
            return Err(Error::EnableNotStarted);
        }
        let hpt = self.hpt.as_ref().ok_or(Error::NotInitialized)?;
        if let Err(e) = self.tracker.rebuild(hpt) {
            self.state = GuardState::Disabled;
            return Err(e);
        }
        self.state = GuardState::Enabled;
        Ok(())
    }

    /// Returns to `Disabled` after a failure between `begin_enable` and `finish_enable`.
    pub fn abort_enable(&mut self) {
        if self.state == GuardState::Arming {
            self.state = GuardState::Disabled;
        }
    }

    /// Unmaps `[start, start + num)` from the hypervisor and marks it private.
    pub fn set_private(&mut self, start: Pfn, num: u64) -> Result<()> {
        // Fails for untracked ranges before anything is unmapped.
        self.bitmap.contains_private(start, num)?;
        let enabled = self.state == GuardState::Enabled;
        let hpt = self.hpt.as_mut().ok_or(Error::NotInitialized)?;
        // Records only exist once enabled.
        if enabled {
            self.tracker.unmap_range(hpt, start, num)?;
        } else {
            LinearScan.unmap_range(hpt, start, num)?;
        }
        Ok(self.bitmap.set_private_range(start, num)?)
    }

    /// Marks `[start, start + num)` shared.
    pub fn set_shared(&mut self, start: Pfn, num: u64) -> Result<()> {
        Ok(self.bitmap.set_shared_range(start, num)?)
    }

    /// Returns true if `root` may be installed as the hypervisor's `satp` root.
    pub fn accepts_root(&self, root: Pfn) -> bool {
        if self.state != GuardState::Enabled {
            return true;
        }
        self.layout()
            .map(|l| l.region_holds_page(HptLevel::Pgd, root))
            .unwrap_or(false)
    }
}

impl Default for HptGuard {
    fn default() -> Self {
        Self::new()
    }
}
