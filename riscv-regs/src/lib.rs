// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

#![no_std]
#![allow(missing_docs)]

//! Crate for handling RV64 registers from machine mode.
//! regs - RV64 General Purpose Registers (GPRs), 0-31, and the M-mode trap frame.
//! csrs - M-mode and hypervisor CSRs used by the monitor.
//! decode - decoding of the trapping instructions the monitor emulates or forwards.
//! pmp - encoding of physical memory protection entries.

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

mod csrs;
mod decode;
pub mod fence;
mod pmp;
mod regs;

pub use csrs::*;
pub use decode::*;
pub use pmp::*;
pub use regs::*;
