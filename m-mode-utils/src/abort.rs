// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use core::arch::asm;

/// Stops the calling hart forever. Used when continuing would mean running a guest or the
/// hypervisor on state the monitor can no longer vouch for.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn halt() -> ! {
    loop {
        // Safety: WFI has no side effects beyond stalling the hart until an interrupt arrives,
        // and interrupts stay disabled in M mode so it never returns here for good.
        unsafe {
            asm!("wfi", options(nomem, nostack));
        }
    }
}

/// Stops the calling hart forever. Host builds panic so tests can observe the halt.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn halt() -> ! {
    panic!("hart halted");
}
