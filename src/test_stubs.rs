// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Mutex as StdMutex;
use std::vec::Vec;

use riscv_page_tables::Pte;
use riscv_pages::Pfn;
use riscv_regs::{mstatus, LocalRegisterCopy, MachineCsr, PmpConfig, TrapFrame};

use crate::hart::{HartCsrs, Platform};
use crate::monitor::{MonitorConfig, SecurityMonitor};
pub use crate::DRAM_BASE;

// Fake physical layout, all inside the first 4MB of DRAM: guest-stage tables at 512kB, a page of
// hypervisor memory used as a copy source at 576kB, the HPT area at 1MB, the bitmap (tracking
// 16MB) at 2MB and room for a reverse map at 3MB.
pub const FAKE_MEM_SIZE: u64 = 4 << 20;
pub const GUEST_ROOT: u64 = DRAM_BASE + 0x8_0000;
pub const GUEST_L1: u64 = DRAM_BASE + 0x8_4000;
pub const GUEST_L0: u64 = DRAM_BASE + 0x8_5000;
pub const COPY_SRC: u64 = DRAM_BASE + 0x9_0000;
pub const HPT_BASE: u64 = DRAM_BASE + 0x10_0000;
pub const HPT_SIZE: u64 = 0x1_0000;
pub const PMD_BASE: u64 = HPT_BASE + 0x1000;
pub const PTE_BASE: u64 = HPT_BASE + 0x3000;
pub const BITMAP_BASE: u64 = DRAM_BASE + 0x20_0000;
pub const BITMAP_SIZE: u64 = 0x1000;
#[cfg(feature = "reverse-map")]
pub const RMAP_BASE: u64 = DRAM_BASE + 0x30_0000;
#[cfg(feature = "reverse-map")]
pub const RMAP_SIZE: u64 = 0x4_0000;

/// A fence the monitor executed on a `FakeHart`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeFence {
    SfenceVma(u64, u64),
    HfenceGvma(u64, u64),
    HfenceVvma(u64, u64),
}

/// A hart whose CSRs are a map. Unwritten CSRs read as zero.
pub struct FakeHart {
    id: usize,
    csrs: BTreeMap<u16, u64>,
    guest_instructions: BTreeMap<u64, u32>,
    fences: Vec<FakeFence>,
}

impl FakeHart {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            csrs: BTreeMap::new(),
            guest_instructions: BTreeMap::new(),
            fences: Vec::new(),
        }
    }

    /// Places `raw` at guest virtual address `epc` for `fetch_guest_instruction`.
    pub fn add_guest_instruction(&mut self, epc: u64, raw: u32) {
        self.guest_instructions.insert(epc, raw);
    }

    pub fn fences(&self) -> &[FakeFence] {
        &self.fences
    }
}

impl HartCsrs for FakeHart {
    fn hart_id(&self) -> usize {
        self.id
    }

    fn read_csr(&self, csr: MachineCsr) -> u64 {
        self.csrs.get(&csr.number()).copied().unwrap_or(0)
    }

    fn write_csr(&mut self, csr: MachineCsr, val: u64) {
        self.csrs.insert(csr.number(), val);
    }

    fn fetch_guest_instruction(&mut self, epc: u64) -> Option<u32> {
        self.guest_instructions.get(&epc).copied()
    }

    fn sfence_vma(&mut self, vaddr: u64, asid: u64) {
        self.fences.push(FakeFence::SfenceVma(vaddr, asid));
    }

    fn hfence_gvma(&mut self, gpa_shifted: u64, vmid: u64) {
        self.fences.push(FakeFence::HfenceGvma(gpa_shifted, vmid));
    }

    fn hfence_vvma(&mut self, vaddr: u64, asid: u64) {
        self.fences.push(FakeFence::HfenceVvma(vaddr, asid));
    }
}

/// A platform with `FAKE_MEM_SIZE` bytes of memory at `DRAM_BASE` that records IPIs and PMP
/// writes.
pub struct FakePlatform {
    // Address of the leaked backing memory.
    mem: usize,
    ipis: StdMutex<Vec<u64>>,
    pmp_writes: StdMutex<Vec<(usize, PmpConfig)>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        let mem = vec![0u64; (FAKE_MEM_SIZE / 8) as usize].leak();
        Self {
            mem: mem.as_mut_ptr() as usize,
            ipis: StdMutex::new(Vec::new()),
            pmp_writes: StdMutex::new(Vec::new()),
        }
    }

    pub fn write_u64(&self, addr: u64, val: u64) {
        let ptr = self.phys_ptr(addr, 8).unwrap() as *mut u64;
        // Not safe - just a test. The memory is leaked and `addr` is inside it.
        unsafe { ptr.write_volatile(val) };
    }

    /// Returns the hart masks passed to `send_ipi`, oldest first.
    pub fn ipis(&self) -> Vec<u64> {
        self.ipis.lock().unwrap().clone()
    }

    /// Returns every `(hart, entry)` programmed, oldest first.
    pub fn pmp_writes(&self) -> Vec<(usize, PmpConfig)> {
        self.pmp_writes.lock().unwrap().clone()
    }
}

impl Platform for FakePlatform {
    fn send_ipi(&self, hart_mask: u64) {
        self.ipis.lock().unwrap().push(hart_mask);
    }

    fn pmp_set(&self, hart_id: usize, pmp: &PmpConfig) {
        self.pmp_writes.lock().unwrap().push((hart_id, *pmp));
    }

    fn phys_ptr(&self, addr: u64, len: u64) -> Option<*mut u8> {
        let end = addr.checked_add(len)?;
        if addr < DRAM_BASE || end > DRAM_BASE + FAKE_MEM_SIZE {
            return None;
        }
        Some((self.mem + (addr - DRAM_BASE) as usize) as *mut u8)
    }
}

/// Returns an Sv39x4 `hgatp` for VM `vmid` rooted at `GUEST_ROOT`.
pub fn guest_hgatp(vmid: u64) -> u64 {
    (8 << 60) | (vmid << 44) | Pfn::from_addr(GUEST_ROOT).bits()
}

/// Maps `pages` guest pages starting at gpa 256MB to consecutive host pages in the guest-stage
/// tables at `GUEST_ROOT`. Returns the first gpa and host address.
pub fn map_guest_pages(platform: &FakePlatform, pages: u64) -> (u64, u64) {
    let gpa = 0x1000_0000;
    let hpa = DRAM_BASE + 0xa_0000;
    let table = |addr| Pte::new(Pfn::from_addr(addr), 0).bits();
    platform.write_u64(GUEST_ROOT + (gpa >> 30) * 8, table(GUEST_L1));
    platform.write_u64(GUEST_L1 + ((gpa >> 21) & 0x1ff) * 8, table(GUEST_L0));
    for i in 0..pages {
        // R | W
        let leaf = Pte::new(Pfn::from_addr(hpa + i * 0x1000), 0x6);
        platform.write_u64(GUEST_L0 + (((gpa >> 12) & 0x1ff) + i) * 8, leaf.bits());
    }
    (gpa, hpa)
}

/// Returns `mstatus` of a trap taken from HS mode.
pub fn hs_status() -> u64 {
    let mut status = LocalRegisterCopy::<u64, mstatus::Register>::new(0);
    status.modify(mstatus::mpp::Supervisor);
    status.get()
}

pub fn single_hart_config() -> MonitorConfig {
    MonitorConfig {
        num_harts: 1,
        ..Default::default()
    }
}

/// Returns a one-hart monitor holding the fake bitmap and HPT area, and its hart.
pub fn initialized_monitor() -> (SecurityMonitor<FakePlatform>, FakeHart) {
    let sm = SecurityMonitor::new(single_hart_config(), FakePlatform::new()).unwrap();
    let mut hart = FakeHart::new(0);
    sm.bitmap_and_hpt_init(
        &mut hart,
        &mut TrapFrame::default(),
        BITMAP_BASE,
        BITMAP_SIZE,
        HPT_BASE,
        HPT_SIZE,
        PMD_BASE,
        PTE_BASE,
    )
    .unwrap();
    (sm, hart)
}

/// As `initialized_monitor`, with validation turned on.
pub fn enabled_monitor() -> (SecurityMonitor<FakePlatform>, FakeHart) {
    let (sm, mut hart) = initialized_monitor();
    sm.monitor_init(&mut hart, &mut TrapFrame::default())
        .unwrap();
    (sm, hart)
}
