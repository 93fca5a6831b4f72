// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Translation fences and spin hints used by the monitor.

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use core::arch::asm;

// Safety: none of these instructions access memory. Fences only order or invalidate cached
// translations on the executing hart.

/// Flushes the first-stage translations of the current address space for `vaddr`/`asid`.
/// Zero for either operand widens the flush, as the instruction does.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn sfence_vma(vaddr: u64, asid: u64) {
    unsafe { asm!("sfence.vma {}, {}", in(reg) vaddr, in(reg) asid) };
}

/// Flushes the guest-stage translations for `gpa >> 2`/`vmid`.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn hfence_gvma(gpa_shifted: u64, vmid: u64) {
    // hfence.gvma rs1, rs2 with rs1 = a0, rs2 = a1.
    unsafe { asm!(".word 0x62b50073", in("a0") gpa_shifted, in("a1") vmid) };
}

/// Flushes the VS-stage translations for `vaddr`/`asid` of the current VMID.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn hfence_vvma(vaddr: u64, asid: u64) {
    // hfence.vvma rs1, rs2 with rs1 = a0, rs2 = a1.
    unsafe { asm!(".word 0x22b50073", in("a0") vaddr, in("a1") asid) };
}

/// Hint that the CPU's rate of instruction retirement should be temporarily paused or reduced.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn pause() {
    unsafe { asm!(".word 0x0100000f") };
}

// Make fence instructions a no-op for testing.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn sfence_vma(_vaddr: u64, _asid: u64) {}
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn hfence_gvma(_gpa_shifted: u64, _vmid: u64) {}
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn hfence_vvma(_vaddr: u64, _asid: u64) {}
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn pause() {
    core::hint::spin_loop();
}
