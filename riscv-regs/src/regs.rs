// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! General purpose registers for RISC-V 64.

use core::mem::size_of;
use memoffset::offset_of;
use static_assertions::const_assert_eq;

/// Array of rv64 general purpose registers with accessors/setters.
/// Used to save state of guest vCPUs while the hypervisor handles their exits.
/// `repr(C)` because it is referenced from assembly.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct GeneralPurposeRegisters([u64; 32]);

/// Index of risc-v general purpose registers in `GeneralPurposeRegisters`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GprIndex {
    Zero = 0,
    RA,
    SP,
    GP,
    TP,
    T0,
    T1,
    T2,
    S0,
    S1,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
    S9,
    S10,
    S11,
    T3,
    T4,
    T5,
    T6,
}

impl GprIndex {
    /// All registers, in encoding order.
    pub const ALL: [GprIndex; 32] = {
        use GprIndex::*;
        [
            Zero, RA, SP, GP, TP, T0, T1, T2, S0, S1, A0, A1, A2, A3, A4, A5, A6, A7, S2, S3, S4,
            S5, S6, S7, S8, S9, S10, S11, T3, T4, T5, T6,
        ]
    };

    /// Returns the register encoded by the 5-bit field `raw`.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Returns the ABI name of the register.
    pub fn name(&self) -> &'static str {
        const NAMES: [&str; 32] = [
            "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3",
            "a4", "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
            "t3", "t4", "t5", "t6",
        ];
        NAMES[*self as usize]
    }
}

impl GeneralPurposeRegisters {
    /// Returns the value of the given register.
    pub fn reg(&self, reg_index: GprIndex) -> u64 {
        self.0[reg_index as usize]
    }

    /// Sets the value of the given register.
    pub fn set_reg(&mut self, reg_index: GprIndex, val: u64) {
        if reg_index == GprIndex::Zero {
            return;
        }

        self.0[reg_index as usize] = val;
    }

    /// Returns the argument registers.
    /// This is avoids many calls when an SBI handler needs all of the argmuent regs.
    pub fn a_regs(&self) -> &[u64] {
        &self.0[GprIndex::A0 as usize..=GprIndex::A7 as usize]
    }

    /// Returns the arguments register as a mutable.
    pub fn a_regs_mut(&mut self) -> &mut [u64] {
        &mut self.0[GprIndex::A0 as usize..=GprIndex::A7 as usize]
    }

    /// Zeroes every register.
    pub fn clear(&mut self) {
        self.0 = [0; 32];
    }

    /// Zeroes every register except the argument registers a0-a7.
    pub fn clear_except_a_regs(&mut self) {
        let mut args = [0u64; 8];
        args.copy_from_slice(self.a_regs());
        self.clear();
        self.a_regs_mut().copy_from_slice(&args);
    }

    /// Zeroes every register except `keep`.
    pub fn clear_except(&mut self, keep: GprIndex) {
        let val = self.reg(keep);
        self.clear();
        self.set_reg(keep, val);
    }
}

/// The register state pushed by the machine-mode trap entry. The firmware's assembly stores the
/// GPRs followed by `mepc` and `mstatus`, and restores them from here on the way out.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct TrapFrame {
    pub gprs: GeneralPurposeRegisters,
    pub mepc: u64,
    pub mstatus: u64,
}

const_assert_eq!(size_of::<TrapFrame>(), 34 * size_of::<u64>());

/// Byte offset of `index` in a `TrapFrame`.
pub const fn trap_frame_gpr_offset(index: GprIndex) -> usize {
    offset_of!(TrapFrame, gprs) + (index as usize) * size_of::<u64>()
}

/// Byte offset of `mepc` in a `TrapFrame`.
pub const TRAP_FRAME_MEPC_OFFSET: usize = offset_of!(TrapFrame, mepc);
/// Byte offset of `mstatus` in a `TrapFrame`.
pub const TRAP_FRAME_MSTATUS_OFFSET: usize = offset_of!(TrapFrame, mstatus);

impl TrapFrame {
    /// Replaces the GPRs with `gprs`, keeping the live `mepc` and `mstatus`.
    pub fn restore_gprs(&mut self, gprs: &GeneralPurposeRegisters) {
        self.gprs = *gprs;
    }
}
