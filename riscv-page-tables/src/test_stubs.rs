// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use riscv_pages::{Pfn, DRAM_BASE};

use crate::*;

// Fake physical layout: the HPT area is a 64kB region 1MB into DRAM with one PGD page and two PMD
// pages. The bitmap tracks the first 16MB of DRAM.
pub const HPT_BASE: u64 = DRAM_BASE + 0x10_0000;
pub const HPT_SIZE: u64 = 0x1_0000;
pub const PMD_START: u64 = HPT_BASE + 0x1000;
pub const PTE_START: u64 = HPT_BASE + 0x3000;
pub const BITMAP_FRAMES: usize = 4096;

pub fn dram_pfn(offset: u64) -> Pfn {
    Pfn::new(Pfn::from_addr(DRAM_BASE).bits() + offset)
}

pub fn stub_layout() -> HptLayout {
    HptLayout::new(HPT_BASE, HPT_SIZE, PMD_START, PTE_START).unwrap()
}

pub fn stub_hpt() -> HptArea {
    let entries = vec![0u64; (HPT_SIZE / PTE_SIZE) as usize];
    HptArea::new(stub_layout(), entries.leak()).unwrap()
}

pub fn leak_bitmap_mem() -> &'static mut [u8] {
    vec![0u8; BITMAP_FRAMES].leak()
}

#[cfg(feature = "reverse-map")]
/// Returns zeroed memory aligned for the reverse map's nodes.
pub fn leak_bytes(len: usize) -> &'static mut [u8] {
    let words = vec![0u64; (len + 7) / 8].leak();
    // Not safe - just a test. The words are leaked so the bytes live forever.
    unsafe { core::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, len) }
}

#[cfg(feature = "reverse-map")]
/// Returns the reverse map size holding `nodes` nodes for the stub bitmap window.
pub fn rmap_bytes(nodes: usize) -> usize {
    BITMAP_FRAMES * 4 + nodes * 16
}

#[cfg(feature = "reverse-map")]
pub fn stub_reverse_map(nodes: usize) -> ReverseMap {
    ReverseMap::new(
        leak_bytes(rmap_bytes(nodes)),
        dram_pfn(0),
        BITMAP_FRAMES as u64,
    )
    .unwrap()
}

pub fn stub_guard() -> HptGuard {
    let mut guard = HptGuard::new();
    guard.init(leak_bitmap_mem(), stub_hpt()).unwrap();
    guard
}
