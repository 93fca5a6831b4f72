// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Encoding of naturally aligned power-of-two (NAPOT) PMP entries.

use tock_registers::register_bitfields;
use tock_registers::LocalRegisterCopy;

// One 8-bit slot of a pmpcfg register.
register_bitfields![u8,
    pub pmpcfg_octet [
        r OFFSET(0) NUMBITS(1) [],
        w OFFSET(1) NUMBITS(1) [],
        x OFFSET(2) NUMBITS(1) [],
        a OFFSET(3) NUMBITS(2) [
            Off = 0,
            Tor = 1,
            Na4 = 2,
            Napot = 3,
        ],
        l OFFSET(7) NUMBITS(1) [],
    ]
];

/// Smallest region a NAPOT entry can describe.
pub const PMP_MIN_LOG2_LEN: u64 = 3;

/// Errors from building a PMP entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmpError {
    /// The region is not a power of two in size, or its base is not aligned to its size.
    NotNaturallyAligned,
}

/// Access granted to S- and U-mode by a PMP entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmpAccess {
    NoAccess,
    ReadOnly,
    ReadWrite,
    ReadWriteExecute,
}

/// One PMP entry: slot index, access, base address and log2 of the size in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmpConfig {
    pub index: usize,
    pub access: PmpAccess,
    pub addr: u64,
    pub log2len: u64,
}

impl PmpConfig {
    /// Creates a NAPOT entry covering `[addr, addr + size)`.
    pub fn napot(index: usize, access: PmpAccess, addr: u64, size: u64) -> Result<Self, PmpError> {
        if !is_napot_region(addr, size) {
            return Err(PmpError::NotNaturallyAligned);
        }
        Ok(Self {
            index,
            access,
            addr,
            log2len: size.trailing_zeros() as u64,
        })
    }

    /// Returns the value for the `pmpaddr` register of this entry.
    pub fn pmpaddr(&self) -> u64 {
        let mask = (1u64 << (self.log2len - PMP_MIN_LOG2_LEN)) - 1;
        ((self.addr >> 2) & !mask) | mask
    }

    /// Returns the 8-bit configuration for this entry's slot in `pmpcfg`.
    pub fn pmpcfg(&self) -> u8 {
        let perms = match self.access {
            PmpAccess::NoAccess => pmpcfg_octet::r::CLEAR,
            PmpAccess::ReadOnly => pmpcfg_octet::r::SET,
            PmpAccess::ReadWrite => pmpcfg_octet::r::SET + pmpcfg_octet::w::SET,
            PmpAccess::ReadWriteExecute => {
                pmpcfg_octet::r::SET + pmpcfg_octet::w::SET + pmpcfg_octet::x::SET
            }
        };
        let mut cfg = LocalRegisterCopy::<u8, pmpcfg_octet::Register>::new(0);
        cfg.modify(perms + pmpcfg_octet::a::Napot);
        cfg.get()
    }
}

/// Returns true if `[addr, addr + size)` can be described by a single NAPOT entry.
pub fn is_napot_region(addr: u64, size: u64) -> bool {
    size.is_power_of_two()
        && size.trailing_zeros() as u64 >= PMP_MIN_LOG2_LEN
        && addr & (size - 1) == 0
}
