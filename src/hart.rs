// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! The hardware seams of the monitor: CSRs of the hart handling a trap, and the platform services
//! (IPIs, PMP programming, physical memory access) the firmware provides.

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use core::arch::asm;

use riscv_regs::{fence, MachineCsr, PmpConfig, Readable, Writeable, CSR};

/// CSR access and M-mode-only instructions on the hart that took the current trap.
pub trait HartCsrs {
    /// Returns the `mhartid` of this hart.
    fn hart_id(&self) -> usize;

    /// Reads `csr`.
    fn read_csr(&self, csr: MachineCsr) -> u64;

    /// Writes `val` to `csr`.
    fn write_csr(&mut self, csr: MachineCsr, val: u64);

    /// Sets `bits` in `csr`.
    fn set_csr_bits(&mut self, csr: MachineCsr, bits: u64) {
        let val = self.read_csr(csr);
        self.write_csr(csr, val | bits);
    }

    /// Clears `bits` in `csr`.
    fn clear_csr_bits(&mut self, csr: MachineCsr, bits: u64) {
        let val = self.read_csr(csr);
        self.write_csr(csr, val & !bits);
    }

    /// Reads the instruction at guest virtual address `epc` through the guest's translation, or
    /// `None` if it can't be read.
    fn fetch_guest_instruction(&mut self, epc: u64) -> Option<u32>;

    fn sfence_vma(&mut self, vaddr: u64, asid: u64);

    fn hfence_gvma(&mut self, gpa_shifted: u64, vmid: u64);

    fn hfence_vvma(&mut self, vaddr: u64, asid: u64);
}

/// Services the firmware provides to the monitor. Shared by every hart.
pub trait Platform: Sync {
    /// Raises a machine software interrupt on every hart set in `hart_mask`.
    fn send_ipi(&self, hart_mask: u64);

    /// Programs `pmp` into the PMP registers of the calling hart, `hart_id`.
    fn pmp_set(&self, hart_id: usize, pmp: &PmpConfig);

    /// Returns a pointer through which the monitor can access `[addr, addr + len)`, or `None` if
    /// the range isn't memory the monitor may touch.
    fn phys_ptr(&self, addr: u64, len: u64) -> Option<*mut u8>;

    /// Reads the naturally aligned doubleword at physical address `addr`.
    fn read_phys_u64(&self, addr: u64) -> Option<u64> {
        if addr % 8 != 0 {
            return None;
        }
        let ptr = self.phys_ptr(addr, 8)?;
        // Safety: `phys_ptr` vouches for 8 accessible bytes and `addr` is 8-byte aligned.
        Some(unsafe { (ptr as *const u64).read_volatile() })
    }
}

/// The hart executing the monitor, accessed through the real CSRs.
pub struct MachineHart {
    hart_id: usize,
}

impl MachineHart {
    /// Returns the hart this code is running on.
    pub fn current() -> Self {
        Self {
            hart_id: CSR.mhartid.get() as usize,
        }
    }
}

// Loads the halfword at guest virtual address `addr` with execute permission, as the guest would
// fetch it.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn hlvx_hu(addr: u64) -> u64 {
    let val: u64;
    // Safety: hlvx.hu reads guest memory through vsatp/hgatp and writes only a0. A faulting
    // access is taken by the firmware's M-mode trap handler.
    unsafe {
        // hlvx.hu a0, (a1)
        asm!(".word 0x6435c573", in("a1") addr, out("a0") val);
    }
    val
}

impl HartCsrs for MachineHart {
    fn hart_id(&self) -> usize {
        self.hart_id
    }

    fn read_csr(&self, csr: MachineCsr) -> u64 {
        use MachineCsr::*;
        match csr {
            Mstatus => CSR.mstatus.get(),
            Medeleg => CSR.medeleg.get(),
            Mideleg => CSR.mideleg.get(),
            Hstatus => CSR.hstatus.get(),
            Hedeleg => CSR.hedeleg.get(),
            Htval => CSR.htval.get(),
            Htinst => CSR.htinst.get(),
            Hgatp => CSR.hgatp.get(),
            Stvec => CSR.stvec.get(),
            Sepc => CSR.sepc.get(),
            Scause => CSR.scause.get(),
            Stval => CSR.stval.get(),
            Satp => CSR.satp.get(),
            Vsstatus => CSR.vsstatus.get(),
            Vstvec => CSR.vstvec.get(),
            Vsepc => CSR.vsepc.get(),
            Vscause => CSR.vscause.get(),
            Vstval => CSR.vstval.get(),
        }
    }

    fn write_csr(&mut self, csr: MachineCsr, val: u64) {
        use MachineCsr::*;
        match csr {
            Mstatus => CSR.mstatus.set(val),
            Medeleg => CSR.medeleg.set(val),
            Mideleg => CSR.mideleg.set(val),
            Hstatus => CSR.hstatus.set(val),
            Hedeleg => CSR.hedeleg.set(val),
            Htval => CSR.htval.set(val),
            Htinst => CSR.htinst.set(val),
            Hgatp => CSR.hgatp.set(val),
            Stvec => CSR.stvec.set(val),
            Sepc => CSR.sepc.set(val),
            Scause => CSR.scause.set(val),
            Stval => CSR.stval.set(val),
            Satp => CSR.satp.set(val),
            Vsstatus => CSR.vsstatus.set(val),
            Vstvec => CSR.vstvec.set(val),
            Vsepc => CSR.vsepc.set(val),
            Vscause => CSR.vscause.set(val),
            Vstval => CSR.vstval.set(val),
        }
    }

    // Use csrrs/csrrc for the bits that are commonly flipped so the update is a single instruction.
    fn set_csr_bits(&mut self, csr: MachineCsr, bits: u64) {
        match csr {
            MachineCsr::Mstatus => {
                CSR.mstatus.read_and_set_bits(bits);
            }
            MachineCsr::Mideleg => {
                CSR.mideleg.read_and_set_bits(bits);
            }
            _ => {
                let val = self.read_csr(csr);
                self.write_csr(csr, val | bits);
            }
        }
    }

    fn clear_csr_bits(&mut self, csr: MachineCsr, bits: u64) {
        match csr {
            MachineCsr::Mstatus => {
                CSR.mstatus.read_and_clear_bits(bits);
            }
            MachineCsr::Mideleg => {
                CSR.mideleg.read_and_clear_bits(bits);
            }
            _ => {
                let val = self.read_csr(csr);
                self.write_csr(csr, val & !bits);
            }
        }
    }

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    fn fetch_guest_instruction(&mut self, epc: u64) -> Option<u32> {
        let low = hlvx_hu(epc) as u32;
        if low & 0x3 != 0x3 {
            // Compressed.
            return Some(low);
        }
        let high = hlvx_hu(epc.checked_add(2)?) as u32;
        Some(low | (high << 16))
    }

    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    fn fetch_guest_instruction(&mut self, _epc: u64) -> Option<u32> {
        None
    }

    fn sfence_vma(&mut self, vaddr: u64, asid: u64) {
        fence::sfence_vma(vaddr, asid);
    }

    fn hfence_gvma(&mut self, gpa_shifted: u64, vmid: u64) {
        fence::hfence_gvma(gpa_shifted, vmid);
    }

    fn hfence_vvma(&mut self, vaddr: u64, asid: u64) {
        fence::hfence_vvma(vaddr, asid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::*;
    use crate::DRAM_BASE;

    #[test]
    fn csr_bit_helpers() {
        let mut hart = FakeHart::new(0);
        hart.write_csr(MachineCsr::Medeleg, 0xf0);
        hart.set_csr_bits(MachineCsr::Medeleg, 0x3);
        hart.clear_csr_bits(MachineCsr::Medeleg, 0x30);
        assert_eq!(hart.read_csr(MachineCsr::Medeleg), 0xc3);
    }

    #[test]
    fn physical_reads() {
        let platform = FakePlatform::new();
        platform.write_u64(DRAM_BASE + 0x8, 0x1234);
        assert_eq!(platform.read_phys_u64(DRAM_BASE + 0x8), Some(0x1234));
        assert_eq!(platform.read_phys_u64(DRAM_BASE + 0x9), None);
        assert_eq!(platform.read_phys_u64(DRAM_BASE - 0x8), None);
        assert_eq!(platform.read_phys_u64(DRAM_BASE + FAKE_MEM_SIZE), None);
    }
}
