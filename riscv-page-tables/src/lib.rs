// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Validation of the hypervisor's page tables from M mode.
//!
//! ## Key types
//!
//! - `HptArea` is the region of memory the hypervisor must keep all of its page tables in, split
//!   into a top-level (PGD), mid-level (PMD) and leaf sub-region. The monitor maps it read-only
//!   for HS mode, so every entry write goes through the monitor.
//! - `HptGuard` owns the `PageBitmap` and the `HptArea`, and checks every entry write so the
//!   hypervisor can never map a private page or point a table outside the area.
//! - `MappingTracker` records which entries map which frames so they can be invalidated when a
//!   frame turns private. `LinearScan` keeps no records and walks the whole area; `ReverseMap`
//!   keeps per-frame lists in monitor-owned memory.
//! - `translate_gpa` resolves guest physical addresses through a guest-stage table.
//!
//! ## Enabling
//!
//! `begin_enable` scans the existing tables, the caller then arms TVM on every hart without
//! holding the page-state lock, and `finish_enable` rebuilds the tracker and turns validation on.
#![no_std]

// Include std when running unit tests.
#[cfg(test)]
#[macro_use]
extern crate std;

/// Resolution of guest physical addresses.
pub mod gstage;
mod guard;
mod hpt;
/// Provides access to the fields of a riscv PTE.
mod pte;
#[cfg(feature = "reverse-map")]
mod reverse_map;
/// Provides stubs for test harnesses.
#[cfg(test)]
mod test_stubs;
mod tracker;

pub use guard::{GuardState, HptGuard};
pub use gstage::{translate_gpa, GuestStageMode};
pub use hpt::Error as HptError;
pub use hpt::Result as HptResult;
pub use hpt::{HptArea, HptLayout, HptLevel, PTE_SIZE};
pub use pte::{Pte, PteFieldBit};
#[cfg(feature = "reverse-map")]
pub use reverse_map::ReverseMap;
pub use tracker::{LinearScan, MappingTracker, Unmapper};
