// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use riscv_pages::Pfn;

// Both Sv39 and Sv48 use 44 bits for the page frame number.
const PFN_BITS: u64 = 44;
const PFN_MASK: u64 = (1 << PFN_BITS) - 1;
// Risc-V PTEs keep the PFN starting at bit 10. The first 10 bits are for the `PteFieldBits1` and
// two bits reserved for the supervisor `RSW` in the privileged spec.
const PFN_SHIFT: u64 = 10;

/// Bits from a Risc-V PTE.
#[derive(Copy, Clone)]
pub enum PteFieldBit {
    Valid = 0,
    Read = 1,
    Write = 2,
    Execute = 3,
    User = 4,
    Global = 5,
    Accessed = 6,
    Dirty = 7,
}

impl PteFieldBit {
    pub const fn shift(&self) -> u64 {
        *self as u64
    }

    pub const fn mask(&self) -> u64 {
        1 << self.shift()
    }

    pub const fn is_set(&self, val: u64) -> bool {
        val & self.mask() != 0
    }
}

const MASK_RWX: u64 =
    PteFieldBit::Read.mask() | PteFieldBit::Write.mask() | PteFieldBit::Execute.mask();

/// A copy of a Risc-V PTE as read from, or about to be written to, the HPT area.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    /// Wraps the raw bits of an entry.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Builds a valid entry for `pfn` with the status bits in `flags`.
    pub const fn new(pfn: Pfn, flags: u64) -> Self {
        let status = flags & ((1 << PFN_SHIFT) - 1);
        Self((pfn.bits() << PFN_SHIFT) | status | PteFieldBit::Valid.mask())
    }

    /// Returns the raw bits the make up the PTE.
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Returns `true` if the entry is valid.
    pub const fn valid(&self) -> bool {
        PteFieldBit::Valid.is_set(self.0)
    }

    /// Returns `true` if the entry is a leaf.
    pub const fn leaf(&self) -> bool {
        self.0 & MASK_RWX != 0
    }

    /// Returns `true` if the entry is valid and maps memory.
    pub const fn valid_leaf(&self) -> bool {
        self.valid() && self.leaf()
    }

    /// Returns the pfn of this entry.
    pub const fn pfn(&self) -> Pfn {
        Pfn::new((self.0 >> PFN_SHIFT) & PFN_MASK)
    }

    /// Returns the same entry with the valid bit cleared.
    pub const fn invalidated(&self) -> Self {
        Self(self.0 & !PteFieldBit::Valid.mask())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_and_table_entries() {
        let rw = PteFieldBit::Read.mask() | PteFieldBit::Write.mask();
        let leaf = Pte::new(Pfn::new(0x80200), rw);
        assert!(leaf.valid_leaf());
        assert_eq!(leaf.pfn(), Pfn::new(0x80200));
        assert_eq!(leaf.bits(), (0x80200 << 10) | 0x7);

        let table = Pte::new(Pfn::new(0x80101), 0);
        assert!(table.valid());
        assert!(!table.leaf());

        let gone = leaf.invalidated();
        assert!(!gone.valid());
        assert_eq!(gone.pfn(), leaf.pfn());
    }

    #[test]
    fn high_attribute_bits_are_not_part_of_the_pfn() {
        // Svpbmt/Svnapot bits live above the PPN.
        let pte = Pte::from_bits((1 << 63) | (1 << 61) | (0x80000 << 10) | 0xf);
        assert_eq!(pte.pfn(), Pfn::new(0x80000));
    }
}
