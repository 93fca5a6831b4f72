// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Tock Register interface for using CSR registers.

pub mod csr_access;
pub mod defs;
pub mod traps;

pub use tock_registers::interfaces::ReadWriteable;
pub use tock_registers::interfaces::Readable;
pub use tock_registers::interfaces::Writeable;
pub use tock_registers::LocalRegisterCopy;

pub use defs::*;
pub use traps::*;

use csr_access::ReadWriteRiscvCsr;

pub const CSR_STVEC: u16 = 0x105;
pub const CSR_SEPC: u16 = 0x141;
pub const CSR_SCAUSE: u16 = 0x142;
pub const CSR_STVAL: u16 = 0x143;
pub const CSR_SATP: u16 = 0x180;
pub const CSR_VSSTATUS: u16 = 0x200;
pub const CSR_VSTVEC: u16 = 0x205;
pub const CSR_VSEPC: u16 = 0x241;
pub const CSR_VSCAUSE: u16 = 0x242;
pub const CSR_VSTVAL: u16 = 0x243;
pub const CSR_MSTATUS: u16 = 0x300;
pub const CSR_MEDELEG: u16 = 0x302;
pub const CSR_MIDELEG: u16 = 0x303;
pub const CSR_HSTATUS: u16 = 0x600;
pub const CSR_HEDELEG: u16 = 0x602;
pub const CSR_HTVAL: u16 = 0x643;
pub const CSR_HTINST: u16 = 0x64a;
pub const CSR_HGATP: u16 = 0x680;
pub const CSR_MHARTID: u16 = 0xf14;

/// The CSRs the monitor reads or writes on behalf of a trapping hart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineCsr {
    Mstatus,
    Medeleg,
    Mideleg,
    Hstatus,
    Hedeleg,
    Htval,
    Htinst,
    Hgatp,
    Stvec,
    Sepc,
    Scause,
    Stval,
    Satp,
    Vsstatus,
    Vstvec,
    Vsepc,
    Vscause,
    Vstval,
}

impl MachineCsr {
    /// Returns the CSR number.
    pub fn number(&self) -> u16 {
        use MachineCsr::*;
        match self {
            Mstatus => CSR_MSTATUS,
            Medeleg => CSR_MEDELEG,
            Mideleg => CSR_MIDELEG,
            Hstatus => CSR_HSTATUS,
            Hedeleg => CSR_HEDELEG,
            Htval => CSR_HTVAL,
            Htinst => CSR_HTINST,
            Hgatp => CSR_HGATP,
            Stvec => CSR_STVEC,
            Sepc => CSR_SEPC,
            Scause => CSR_SCAUSE,
            Stval => CSR_STVAL,
            Satp => CSR_SATP,
            Vsstatus => CSR_VSSTATUS,
            Vstvec => CSR_VSTVEC,
            Vsepc => CSR_VSEPC,
            Vscause => CSR_VSCAUSE,
            Vstval => CSR_VSTVAL,
        }
    }
}

pub struct CSR {
    pub mhartid: ReadWriteRiscvCsr<xreg::Register, CSR_MHARTID>,
    pub mstatus: ReadWriteRiscvCsr<mstatus::Register, CSR_MSTATUS>,
    pub medeleg: ReadWriteRiscvCsr<xreg::Register, CSR_MEDELEG>,
    pub mideleg: ReadWriteRiscvCsr<mip::Register, CSR_MIDELEG>,

    pub hstatus: ReadWriteRiscvCsr<hstatus::Register, CSR_HSTATUS>,
    pub hedeleg: ReadWriteRiscvCsr<xreg::Register, CSR_HEDELEG>,
    pub htval: ReadWriteRiscvCsr<xreg::Register, CSR_HTVAL>,
    pub htinst: ReadWriteRiscvCsr<xreg::Register, CSR_HTINST>,
    pub hgatp: ReadWriteRiscvCsr<hgatp::Register, CSR_HGATP>,

    pub stvec: ReadWriteRiscvCsr<tvec::Register, CSR_STVEC>,
    pub sepc: ReadWriteRiscvCsr<xreg::Register, CSR_SEPC>,
    pub scause: ReadWriteRiscvCsr<mcause::Register, CSR_SCAUSE>,
    pub stval: ReadWriteRiscvCsr<xreg::Register, CSR_STVAL>,
    pub satp: ReadWriteRiscvCsr<satp::Register, CSR_SATP>,

    pub vsstatus: ReadWriteRiscvCsr<vsstatus::Register, CSR_VSSTATUS>,
    pub vstvec: ReadWriteRiscvCsr<tvec::Register, CSR_VSTVEC>,
    pub vsepc: ReadWriteRiscvCsr<xreg::Register, CSR_VSEPC>,
    pub vscause: ReadWriteRiscvCsr<mcause::Register, CSR_VSCAUSE>,
    pub vstval: ReadWriteRiscvCsr<xreg::Register, CSR_VSTVAL>,
}

// Define the "addresses" of each CSR register.
pub const CSR: &CSR = &CSR {
    mhartid: ReadWriteRiscvCsr::new(),
    mstatus: ReadWriteRiscvCsr::new(),
    medeleg: ReadWriteRiscvCsr::new(),
    mideleg: ReadWriteRiscvCsr::new(),

    hstatus: ReadWriteRiscvCsr::new(),
    hedeleg: ReadWriteRiscvCsr::new(),
    htval: ReadWriteRiscvCsr::new(),
    htinst: ReadWriteRiscvCsr::new(),
    hgatp: ReadWriteRiscvCsr::new(),

    stvec: ReadWriteRiscvCsr::new(),
    sepc: ReadWriteRiscvCsr::new(),
    scause: ReadWriteRiscvCsr::new(),
    stval: ReadWriteRiscvCsr::new(),
    satp: ReadWriteRiscvCsr::new(),

    vsstatus: ReadWriteRiscvCsr::new(),
    vstvec: ReadWriteRiscvCsr::new(),
    vsepc: ReadWriteRiscvCsr::new(),
    vscause: ReadWriteRiscvCsr::new(),
    vstval: ReadWriteRiscvCsr::new(),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessor_numbers() {
        assert_eq!(CSR.hgatp.number(), MachineCsr::Hgatp.number());
        assert_eq!(CSR.vstvec.number(), 0x205);
        assert_eq!(MachineCsr::Htinst.number(), 0x64a);
    }
}
