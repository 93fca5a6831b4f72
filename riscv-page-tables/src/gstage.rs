// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Resolution of guest physical addresses through a guest-stage page table.

use riscv_pages::{Pfn, PFN_SHIFT};

use crate::hpt::{Error, Result, PTE_SIZE};
use crate::pte::Pte;

const LEVEL_BITS: u64 = 9;
// The root table of an x4 mode is four pages, which adds two bits to the top index.
const ROOT_EXTRA_BITS: u64 = 2;

/// Guest-stage translation modes, as encoded in `hgatp.MODE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestStageMode {
    Bare,
    Sv39x4,
    Sv48x4,
}

impl GuestStageMode {
    /// Returns the mode for the 4-bit `hgatp.MODE` field.
    pub fn from_hgatp_mode(mode: u64) -> Result<Self> {
        match mode {
            0 => Ok(GuestStageMode::Bare),
            8 => Ok(GuestStageMode::Sv39x4),
            9 => Ok(GuestStageMode::Sv48x4),
            m => Err(Error::UnsupportedMode(m)),
        }
    }

    fn levels(&self) -> u64 {
        match self {
            GuestStageMode::Bare => 0,
            GuestStageMode::Sv39x4 => 3,
            GuestStageMode::Sv48x4 => 4,
        }
    }

    /// Returns the number of guest physical address bits the mode translates.
    pub fn gpa_bits(&self) -> u64 {
        match self {
            GuestStageMode::Bare => 64,
            _ => PFN_SHIFT + self.levels() * LEVEL_BITS + ROOT_EXTRA_BITS,
        }
    }
}

/// Translates `gpa` by walking the table rooted at `root`. `read_pte` loads the 8-byte entry at a
/// physical address, or returns `None` if the monitor can't access it.
pub fn translate_gpa<F>(mode: GuestStageMode, root: Pfn, gpa: u64, read_pte: F) -> Result<u64>
where
    F: Fn(u64) -> Option<u64>,
{
    if mode == GuestStageMode::Bare {
        return Ok(gpa);
    }
    if gpa >> mode.gpa_bits() != 0 {
        return Err(Error::UnmappedGuestAddress(gpa));
    }

    let mut table = root.addr();
    for level in (0..mode.levels()).rev() {
        let shift = PFN_SHIFT + level * LEVEL_BITS;
        let index_bits = if level == mode.levels() - 1 {
            LEVEL_BITS + ROOT_EXTRA_BITS
        } else {
            LEVEL_BITS
        };
        let index = (gpa >> shift) & ((1 << index_bits) - 1);
        let bits = read_pte(table + index * PTE_SIZE).ok_or(Error::UnmappedGuestAddress(gpa))?;
        let pte = Pte::from_bits(bits);
        if !pte.valid() {
            return Err(Error::UnmappedGuestAddress(gpa));
        }
        if pte.leaf() {
            let offset_mask = (1u64 << shift) - 1;
            // A superpage must be aligned to its size.
            if pte.pfn().addr() & offset_mask != 0 {
                return Err(Error::UnmappedGuestAddress(gpa));
            }
            return Ok(pte.pfn().addr() | (gpa & offset_mask));
        }
        table = pte.pfn().addr();
    }
    Err(Error::UnmappedGuestAddress(gpa))
}
