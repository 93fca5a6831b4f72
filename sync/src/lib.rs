// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! # Locks usable from machine mode.
//!
//! The monitor runs with interrupts disabled on every hart, so spinning is the only way to wait.
//! The page-state lock, the vCPU slot locks and the cross-hart mailboxes are all `Mutex`es from
//! here.
#![no_std]

pub use spin::{Mutex, MutexGuard};
