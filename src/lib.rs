// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # cove-sm: a machine-mode security monitor for confidential VMs
//!
//! The monitor runs next to the M-mode firmware and keeps the hypervisor from reaching the memory
//! and register state of confidential guests. The firmware's trap entry calls
//! [`SecurityMonitor::handle_trap`] for every trap it takes and only deals with the trap itself
//! when the monitor returns [`TrapOutcome::NotHandled`].
//!
//! ## Memory
//!
//! Every 4kB frame of DRAM is classified in a byte-per-frame bitmap as public, shared or
//! private. The hypervisor keeps all of its page tables inside one area the monitor maps
//! read-only for HS mode, and every entry write is a call to the monitor, which refuses
//! mappings of private frames. Turning a frame private first unmaps it, either through a
//! reverse map or by scanning the whole area.
//!
//! ## Guest exits
//!
//! While a guest runs, the causes of its exits are taken back from HS mode. On an exit the
//! monitor saves the guest's registers, hands HS mode only what it needs to handle the exit, and
//! restores the registers when the hypervisor resumes the vCPU.
//!
//! ## Harts
//!
//! Protection changes that must hold on every hart (PMP entries, `mstatus.TVM`) are applied
//! locally and pushed to the other harts over per-hart mailboxes and an IPI.
#![no_std]

// Include std when running unit tests.
#[cfg(test)]
#[macro_use]
extern crate std;

mod ecall;
pub mod hart;
pub mod hart_sync;
pub mod monitor;
#[cfg(test)]
mod test_stubs;
pub mod trap;
mod tvm;
pub mod vm_cpu;

use static_assertions::const_assert;

/// Number of harts the cross-hart mailboxes are sized for.
pub const MAX_HARTS: usize = 8;
/// Number of VM buckets in the vCPU record table. VMs are hashed by VMID.
pub const VM_BUCKETS: usize = 8;
/// Number of vCPUs tracked per VM bucket.
pub const MAX_VCPUS: usize = 8;

// IPI targets are passed as a 64-bit hart mask.
const_assert!(MAX_HARTS <= 64);

pub use riscv_pages::DRAM_BASE;

pub use hart::{HartCsrs, MachineHart, Platform};
pub use monitor::{MonitorConfig, SecurityMonitor};
pub use trap::TrapOutcome;
