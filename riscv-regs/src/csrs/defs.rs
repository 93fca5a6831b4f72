// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use tock_registers::register_bitfields;
use tock_registers::LocalRegisterCopy;

// Machine status.
register_bitfields![u64,
    pub mstatus [
        // Global S-mode interrupt enable.
        sie OFFSET(1) NUMBITS(1) [],
        mie OFFSET(3) NUMBITS(1) [],
        // S-mode interrupt enable prior to the last trap into S-mode.
        spie OFFSET(5) NUMBITS(1) [],
        mpie OFFSET(7) NUMBITS(1) [],
        // Privilege level before the last trap into S-mode.
        spp OFFSET(8) NUMBITS(1) [
            User = 0,
            Supervisor = 1,
        ],
        // Privilege level before the last trap into M-mode.
        mpp OFFSET(11) NUMBITS(2) [
            User = 0,
            Supervisor = 1,
            Machine = 3,
        ],
        mprv OFFSET(17) NUMBITS(1) [],
        // Trap Virtual Memory: satp/hgatp accesses and fences from HS-mode trap to M-mode.
        tvm OFFSET(20) NUMBITS(1) [],
        tw OFFSET(21) NUMBITS(1) [],
        // Trap SRET: sret from HS-mode traps to M-mode.
        tsr OFFSET(22) NUMBITS(1) [],
        // The last trap into M-mode carried a guest virtual address in mtval.
        gva OFFSET(38) NUMBITS(1) [],
        // Virtualization mode before the last trap into M-mode.
        mpv OFFSET(39) NUMBITS(1) [],
    ]
];

// Virtual supervisor status, only the trap-entry bits.
register_bitfields![u64,
    pub vsstatus [
        sie OFFSET(1) NUMBITS(1) [],
        spie OFFSET(5) NUMBITS(1) [],
        spp OFFSET(8) NUMBITS(1) [
            User = 0,
            Supervisor = 1,
        ],
    ]
];

// Hypervisor status.
register_bitfields![u64,
    pub hstatus [
        // Guest virtual address. Set when stval holds a guest virtual address.
        gva OFFSET(6) NUMBITS(1) [],
        // Supervisor Previous Virtualization mode.
        spv OFFSET(7) NUMBITS(1) [],
        // Supervisor Previous Virtual Privilege. Nominal privilege of the guest at trap time.
        spvp OFFSET(8) NUMBITS(1) [
            User = 0,
            Supervisor = 1,
        ],
        hu OFFSET(9) NUMBITS(1) [],
        vgein OFFSET(12) NUMBITS(6) [],
        vtvm OFFSET(20) NUMBITS(1) [],
        vtw OFFSET(21) NUMBITS(1) [],
        vtsr OFFSET(22) NUMBITS(1) [],
    ]
];

// Interrupt pending/delegation bits, shared by mip, mie and mideleg.
register_bitfields![u64,
    pub mip [
        ssoft OFFSET(1) NUMBITS(1) [],
        vssoft OFFSET(2) NUMBITS(1) [],
        msoft OFFSET(3) NUMBITS(1) [],
        stimer OFFSET(5) NUMBITS(1) [],
        vstimer OFFSET(6) NUMBITS(1) [],
        mtimer OFFSET(7) NUMBITS(1) [],
        sext OFFSET(9) NUMBITS(1) [],
        vsext OFFSET(10) NUMBITS(1) [],
        mext OFFSET(11) NUMBITS(1) [],
        sgext OFFSET(12) NUMBITS(1) [],
    ]
];

/// The supervisor interrupts the monitor takes back from HS-mode while a guest runs.
pub const MIDELEG_SUPERVISOR_INTERRUPTS: u64 = (1 << 1) | (1 << 5) | (1 << 9);

// Registers holding a plain value: addresses, trap values, delegation masks.
register_bitfields![u64,
    pub xreg [
        val OFFSET(0) NUMBITS(64) []
    ]
];

// Trap cause.
register_bitfields![u64,
    pub mcause [
        code OFFSET(0) NUMBITS(63) [],
        is_interrupt OFFSET(63) NUMBITS(1) [],
    ]
];

// Trap handler base address, used for stvec and vstvec.
register_bitfields![u64,
    pub tvec [
        mode OFFSET(0) NUMBITS(2) [
            Direct = 0,
            Vectored = 1
        ],
        trap_addr OFFSET(2) NUMBITS(62) [],
    ]
];

pub trait TvecHelpers {
    fn get_trap_address(&self) -> u64;
}

impl TvecHelpers for LocalRegisterCopy<u64, tvec::Register> {
    fn get_trap_address(&self) -> u64 {
        self.read(tvec::trap_addr) << 2
    }
}

// Supervisor address translation and protection.
register_bitfields![u64,
    pub satp [
        ppn OFFSET(0) NUMBITS(44) [],
        asid OFFSET(44) NUMBITS(16) [],
        mode OFFSET(60) NUMBITS(4) [
            Bare = 0,
            Sv39 = 8,
            Sv48 = 9,
            Sv57 = 10,
        ],
    ]
];

// Hypervisor guest address translation and protection.
register_bitfields![u64,
    pub hgatp [
        ppn OFFSET(0) NUMBITS(44) [],
        vmid OFFSET(44) NUMBITS(14) [],
        mode OFFSET(60) NUMBITS(4) [
            Bare = 0,
            Sv39x4 = 8,
            Sv48x4 = 9,
            Sv57x4 = 10,
        ],
    ]
];

pub trait HgatpHelpers {
    /// Returns the VM identifier.
    fn vmid(&self) -> u64;

    /// Returns the value with the translation root and mode stripped, keeping only the VMID.
    fn vmid_only(&self) -> u64;
}

impl HgatpHelpers for LocalRegisterCopy<u64, hgatp::Register> {
    fn vmid(&self) -> u64 {
        self.read(hgatp::vmid)
    }

    fn vmid_only(&self) -> u64 {
        (hgatp::vmid.val(self.vmid()) + hgatp::mode::Bare).value
    }
}
