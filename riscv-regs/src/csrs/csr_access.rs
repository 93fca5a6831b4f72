// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! `ReadWriteRiscvCsr` type for the CSRs the monitor touches from machine mode.

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use core::arch::asm;
use core::marker::PhantomData;

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::RegisterLongName;

/// Read/Write registers.
#[derive(Copy, Clone)]
pub struct ReadWriteRiscvCsr<R: RegisterLongName, const V: u16> {
    associated_register: PhantomData<R>,
}

impl<R: RegisterLongName, const V: u16> ReadWriteRiscvCsr<R, V> {
    pub const fn new() -> Self {
        ReadWriteRiscvCsr {
            associated_register: PhantomData,
        }
    }

    /// Returns the CSR number this accessor targets.
    pub const fn number(&self) -> u16 {
        V
    }

    /// Sets the bits in `bitmask` with `csrrs`, returning the previous value.
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    #[inline]
    pub fn read_and_set_bits(&self, bitmask: u64) -> u64 {
        let r: u64;
        // Safety: csrrs only touches the named CSR.
        unsafe {
            asm!("csrrs {rd}, {csr}, {rs1}",
                 rd = out(reg) r,
                 csr = const V,
                 rs1 = in(reg) bitmask);
        }
        r
    }

    /// Clears the bits in `bitmask` with `csrrc`, returning the previous value.
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    #[inline]
    pub fn read_and_clear_bits(&self, bitmask: u64) -> u64 {
        let r: u64;
        // Safety: csrrc only touches the named CSR.
        unsafe {
            asm!("csrrc {rd}, {csr}, {rs1}",
                 rd = out(reg) r,
                 csr = const V,
                 rs1 = in(reg) bitmask);
        }
        r
    }

    // Host builds have no CSRs. Tests go through the `HartCsrs` fakes instead.
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    pub fn read_and_set_bits(&self, bitmask: u64) -> u64 {
        unimplemented!("csrrs on CSR 0x{:x}, bitmask 0x{:x}", V, bitmask)
    }

    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    pub fn read_and_clear_bits(&self, bitmask: u64) -> u64 {
        unimplemented!("csrrc on CSR 0x{:x}, bitmask 0x{:x}", V, bitmask)
    }
}

impl<R: RegisterLongName, const V: u16> Readable for ReadWriteRiscvCsr<R, V> {
    type T = u64;
    type R = R;

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    #[inline]
    fn get(&self) -> u64 {
        let r: u64;
        // Safety: reading a CSR has no memory side effects.
        unsafe {
            asm!("csrr {rd}, {csr}", rd = out(reg) r, csr = const V);
        }
        r
    }

    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    fn get(&self) -> u64 {
        unimplemented!("reading CSR 0x{:x}", V)
    }
}

impl<R: RegisterLongName, const V: u16> Writeable for ReadWriteRiscvCsr<R, V> {
    type T = u64;
    type R = R;

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    #[inline]
    fn set(&self, val_to_set: u64) {
        // Safety: writing a CSR has no memory side effects.
        unsafe {
            asm!("csrw {csr}, {rs}", rs = in(reg) val_to_set, csr = const V);
        }
    }

    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    fn set(&self, _val_to_set: u64) {
        unimplemented!("writing CSR 0x{:x}", V)
    }
}
