// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use crate::mcause;
use tock_registers::LocalRegisterCopy;

/// Errors as a result of converting CSR values to Trap enums.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Unknown cause value in CSR.
    UnknownCause(u64),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Trap causes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    Interrupt(Interrupt),
    Exception(Exception),
}

impl Trap {
    /// Returns the Trap corresponding to the raw mcause value.
    pub fn from_mcause(csr: u64) -> Result<Self> {
        Self::try_from(LocalRegisterCopy::<u64, mcause::Register>::new(csr))
    }

    /// Returns the raw mcause encoding of the trap.
    pub fn to_mcause(&self) -> u64 {
        match self {
            Trap::Interrupt(i) => (1 << 63) | *i as u64,
            Trap::Exception(e) => *e as u64,
        }
    }
}

impl TryFrom<LocalRegisterCopy<u64, mcause::Register>> for Trap {
    type Error = Error;

    fn try_from(val: LocalRegisterCopy<u64, mcause::Register>) -> Result<Self> {
        let code = val.read(mcause::code);
        if val.is_set(mcause::is_interrupt) {
            Ok(Trap::Interrupt(Interrupt::from_code(code)?))
        } else {
            Ok(Trap::Exception(Exception::from_code(code)?))
        }
    }
}

/// Interrupt causes.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoft = 1,
    VirtualSupervisorSoft = 2,
    MachineSoft = 3,
    SupervisorTimer = 5,
    VirtualSupervisorTimer = 6,
    MachineTimer = 7,
    SupervisorExternal = 9,
    VirtualSupervisorExternal = 10,
    MachineExternal = 11,
    SupervisorGuestExternal = 12,
}

impl Interrupt {
    pub fn from_code(code: u64) -> Result<Self> {
        use Interrupt::*;
        match code {
            1 => Ok(SupervisorSoft),
            2 => Ok(VirtualSupervisorSoft),
            3 => Ok(MachineSoft),
            5 => Ok(SupervisorTimer),
            6 => Ok(VirtualSupervisorTimer),
            7 => Ok(MachineTimer),
            9 => Ok(SupervisorExternal),
            10 => Ok(VirtualSupervisorExternal),
            11 => Ok(MachineExternal),
            12 => Ok(SupervisorGuestExternal),
            v => Err(Error::UnknownCause(v)),
        }
    }
}

/// Exception causes.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    InstructionMisaligned = 0,
    InstructionFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadMisaligned = 4,
    LoadFault = 5,
    StoreMisaligned = 6,
    StoreFault = 7,
    UserEnvCall = 8,
    SupervisorEnvCall = 9,
    VirtualSupervisorEnvCall = 10,
    MachineEnvCall = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,
    GuestInstructionPageFault = 20,
    GuestLoadPageFault = 21,
    VirtualInstruction = 22,
    GuestStorePageFault = 23,
}

impl Exception {
    pub fn from_code(code: u64) -> Result<Self> {
        use Exception::*;
        match code {
            0 => Ok(InstructionMisaligned),
            1 => Ok(InstructionFault),
            2 => Ok(IllegalInstruction),
            3 => Ok(Breakpoint),
            4 => Ok(LoadMisaligned),
            5 => Ok(LoadFault),
            6 => Ok(StoreMisaligned),
            7 => Ok(StoreFault),
            8 => Ok(UserEnvCall),
            9 => Ok(SupervisorEnvCall),
            10 => Ok(VirtualSupervisorEnvCall),
            11 => Ok(MachineEnvCall),
            12 => Ok(InstructionPageFault),
            13 => Ok(LoadPageFault),
            15 => Ok(StorePageFault),
            20 => Ok(GuestInstructionPageFault),
            21 => Ok(GuestLoadPageFault),
            22 => Ok(VirtualInstruction),
            23 => Ok(GuestStorePageFault),
            v => Err(Error::UnknownCause(v)),
        }
    }

    /// Returns the bit for this exception in medeleg/hedeleg.
    pub fn deleg_mask(&self) -> u64 {
        1 << (*self as u64)
    }

    /// Returns true if this exception is a guest-stage page fault.
    pub fn is_guest_page_fault(&self) -> bool {
        use Exception::*;
        matches!(
            self,
            GuestInstructionPageFault | GuestLoadPageFault | GuestStorePageFault
        )
    }

    /// Returns true if this exception is a physical memory access fault.
    pub fn is_access_fault(&self) -> bool {
        use Exception::*;
        matches!(self, InstructionFault | LoadFault | StoreFault)
    }
}

/// Exceptions raised by a running guest that the monitor intercepts rather than leaving delegated
/// to HS-mode.
pub const GUEST_EXIT_EXCEPTIONS: [Exception; 8] = [
    Exception::InstructionFault,
    Exception::LoadFault,
    Exception::StoreFault,
    Exception::VirtualSupervisorEnvCall,
    Exception::GuestInstructionPageFault,
    Exception::GuestLoadPageFault,
    Exception::VirtualInstruction,
    Exception::GuestStorePageFault,
];

/// Returns the medeleg bits of `GUEST_EXIT_EXCEPTIONS`.
pub fn guest_exit_deleg_mask() -> u64 {
    GUEST_EXIT_EXCEPTIONS
        .iter()
        .fold(0, |mask, e| mask | e.deleg_mask())
}
