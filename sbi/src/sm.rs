// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use crate::error::*;

/// Operation selected by the first argument of `SetPte`.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetPteOp {
    /// Writes one entry.
    SetOne = 0,
    /// Zeroes a run of entries.
    Clear = 1,
    /// Copies a run of entries from hypervisor memory.
    Memcpy = 2,
}

impl SetPteOp {
    fn from_reg(a0: u64) -> Result<Self> {
        use SetPteOp::*;
        Ok(match a0 {
            0 => SetOne,
            1 => Clear,
            2 => Memcpy,
            _ => return Err(Error::InvalidParam),
        })
    }
}

/// Functions of the security monitor extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmFunction {
    /// Marks a physical range as shared between a confidential VM and the hypervisor.
    ///
    /// a6 = 0, a0 = physical address, a1 = size in bytes
    SetShared { paddr: u64, size: u64 },
    /// Hands the monitor its page classification bitmap and the area the hypervisor keeps its
    /// page tables in.
    ///
    /// a6 = 1, a0/a1 = bitmap base/size, a2/a3 = HPT area base/size,
    /// a4 = start of the mid-level tables, a5 = start of the leaf tables
    BitmapAndHptInit {
        bitmap_base: u64,
        bitmap_size: u64,
        hpt_base: u64,
        hpt_size: u64,
        pmd_base: u64,
        pte_base: u64,
    },
    /// Writes entries of the HPT area.
    ///
    /// a6 = 2, a0 = operation, a1 = entry address,
    /// a2 = new entry (`SetOne`) or source address (`Memcpy`),
    /// a3 = page count (`SetOne`) or length in bytes (`Clear`, `Memcpy`)
    SetPte {
        op: SetPteOp,
        addr: u64,
        value: u64,
        size: u64,
    },
    /// Turns on HPT validation and arms TVM on every hart. Returns the caller's new `mstatus`.
    ///
    /// a6 = 3
    MonitorInit,
    /// Hands the monitor memory for the reverse map.
    ///
    /// a6 = 4, a0 = base, a1 = size in bytes
    ReverseMapInit { base: u64, size: u64 },
    /// Asks for the next guest page fault of the vCPU to be decoded as an MMIO access.
    ///
    /// a6 = 5, a0 = vCPU id
    PrepareMmio { cpu_id: u64 },
    /// Restores the vCPU's registers into the caller's frame, replaying `ret0`/`ret1` into the
    /// register the last exit left pending.
    ///
    /// a6 = 6, a0 = vCPU id, a1/a2 = values to replay
    ResumeCpu { cpu_id: u64, ret0: u64, ret1: u64 },
    /// Called by a guest to share a buffer of its memory with the hypervisor.
    ///
    /// a6 = 7, a0 = guest physical address, a1 = size in bytes
    SetBounceBuffer { gpa: u64, size: u64 },
    /// Unmaps a physical range from the hypervisor and marks it private.
    ///
    /// a6 = 8, a0 = physical address, a1 = size in bytes
    SetPrivate { paddr: u64, size: u64 },
}

impl SmFunction {
    /// Attempts to parse `Self` from the passed in `a0-a7`.
    pub(crate) fn from_regs(args: &[u64]) -> Result<Self> {
        use SmFunction::*;
        Ok(match args[6] {
            0 => SetShared {
                paddr: args[0],
                size: args[1],
            },
            1 => BitmapAndHptInit {
                bitmap_base: args[0],
                bitmap_size: args[1],
                hpt_base: args[2],
                hpt_size: args[3],
                pmd_base: args[4],
                pte_base: args[5],
            },
            2 => SetPte {
                op: SetPteOp::from_reg(args[0])?,
                addr: args[1],
                value: args[2],
                size: args[3],
            },
            3 => MonitorInit,
            4 => ReverseMapInit {
                base: args[0],
                size: args[1],
            },
            5 => PrepareMmio { cpu_id: args[0] },
            6 => ResumeCpu {
                cpu_id: args[0],
                ret0: args[1],
                ret1: args[2],
            },
            7 => SetBounceBuffer {
                gpa: args[0],
                size: args[1],
            },
            8 => SetPrivate {
                paddr: args[0],
                size: args[1],
            },
            _ => return Err(Error::NotSupported),
        })
    }

    /// Returns the function id passed in a6.
    pub fn a6(&self) -> u64 {
        use SmFunction::*;
        match self {
            SetShared { .. } => 0,
            BitmapAndHptInit { .. } => 1,
            SetPte { .. } => 2,
            MonitorInit => 3,
            ReverseMapInit { .. } => 4,
            PrepareMmio { .. } => 5,
            ResumeCpu { .. } => 6,
            SetBounceBuffer { .. } => 7,
            SetPrivate { .. } => 8,
        }
    }

    /// Returns the arguments passed in a0-a5.
    pub fn args(&self) -> [u64; 6] {
        use SmFunction::*;
        match *self {
            SetShared { paddr, size } | SetPrivate { paddr, size } => [paddr, size, 0, 0, 0, 0],
            BitmapAndHptInit {
                bitmap_base,
                bitmap_size,
                hpt_base,
                hpt_size,
                pmd_base,
                pte_base,
            } => [
                bitmap_base,
                bitmap_size,
                hpt_base,
                hpt_size,
                pmd_base,
                pte_base,
            ],
            SetPte {
                op,
                addr,
                value,
                size,
            } => [op as u64, addr, value, size, 0, 0],
            MonitorInit => [0; 6],
            ReverseMapInit { base, size } => [base, size, 0, 0, 0, 0],
            PrepareMmio { cpu_id } => [cpu_id, 0, 0, 0, 0, 0],
            ResumeCpu { cpu_id, ret0, ret1 } => [cpu_id, ret0, ret1, 0, 0, 0],
            SetBounceBuffer { gpa, size } => [gpa, size, 0, 0, 0, 0],
        }
    }

    /// Returns true if only a guest running on a tracked vCPU may make this call.
    pub fn is_guest_call(&self) -> bool {
        matches!(self, SmFunction::SetBounceBuffer { .. })
    }
}
