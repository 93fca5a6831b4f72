// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

// Extension constants
/// Security monitor calls, function in a6.
pub const EXT_SM: u64 = 0x534D;
/// vCPU creation. Takes no function id.
pub const EXT_SM_CREATE: u64 = 0x534D43;

// Error constants from the sbi [spec](https://github.com/riscv-non-isa/riscv-sbi-doc/releases)
pub const SBI_SUCCESS: i64 = 0;
