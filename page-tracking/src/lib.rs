// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! # Page ownership tracking
//!
//! Every 4kB frame of DRAM is classified as public (usable by the hypervisor), private (owned by a
//! confidential VM) or shared (owned by a VM but deliberately exposed to the hypervisor). The
//! classification lives in a byte-per-frame `PageBitmap` carved out of memory the hypervisor
//! donates at boot.
//!
//! The bitmap itself is not locked: callers serialize access with the monitor's page-state lock.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

/// Tracks the classification of every DRAM frame.
pub mod bitmap;

pub use bitmap::Error as PageTrackingError;
pub use bitmap::Result as PageTrackingResult;
pub use bitmap::{PageBitmap, PageClass};
