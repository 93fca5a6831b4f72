// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Console output and fatal-error handling for code running in machine mode.
#![no_std]

// Tests capture console output with std types.
#[cfg(test)]
#[macro_use]
extern crate std;

pub mod abort;
pub mod print;
