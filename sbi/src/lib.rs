// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Parsing of the calls the hypervisor and its guests make to the security monitor.
//! `SbiMessage` covers the two monitor extensions; each function enum holds the parsed
//! arguments of one call.
#![no_std]

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

use riscv_regs::{GeneralPurposeRegisters, GprIndex};

mod consts;
pub use consts::*;
mod error;
pub use error::*;
mod sm;
pub use sm::*;

/// The values placed in a0 and a1 when a call returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbiReturn {
    pub error_code: i64,
    pub return_value: u64,
}

impl SbiReturn {
    pub fn success(return_value: u64) -> Self {
        Self {
            error_code: SBI_SUCCESS,
            return_value,
        }
    }

    /// Parses the values a caller finds in a0 and a1.
    pub fn into_result(self) -> Result<u64> {
        match self.error_code {
            SBI_SUCCESS => Ok(self.return_value),
            e => Err(Error::from_code(e)),
        }
    }
}

impl From<Result<u64>> for SbiReturn {
    fn from(result: Result<u64>) -> SbiReturn {
        match result {
            Ok(rv) => Self::success(rv),
            Err(e) => Self::from(e),
        }
    }
}

impl From<Error> for SbiReturn {
    fn from(error: Error) -> SbiReturn {
        SbiReturn {
            error_code: error.to_code(),
            return_value: 0,
        }
    }
}

/// A call to the security monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SbiMessage {
    Sm(SmFunction),
    /// Creates a vCPU of the VM whose VMID is in `hgatp`, starting from the caller's registers.
    /// a1 = vCPU id.
    SmCreate { cpu_id: u64 },
}

/// Returns true if `a7` selects one of the monitor's extensions.
pub fn is_monitor_extension(a7: u64) -> bool {
    matches!(a7, EXT_SM | EXT_SM_CREATE)
}

impl SbiMessage {
    /// Creates an SbiMessage struct from the given GPRs. Intended for use from the ECALL handler
    /// and passed the saved register state from the caller. A7 must contain one of the monitor's
    /// extensions and the other A* registers will be interpreted based on the extension A7
    /// selects.
    pub fn from_regs(gprs: &GeneralPurposeRegisters) -> Result<Self> {
        use GprIndex::*;
        match gprs.reg(A7) {
            EXT_SM => SmFunction::from_regs(gprs.a_regs()).map(SbiMessage::Sm),
            EXT_SM_CREATE => Ok(SbiMessage::SmCreate {
                cpu_id: gprs.reg(A1),
            }),
            _ => Err(Error::NotSupported),
        }
    }

    /// Returns the register value for this `SbiMessage`.
    pub fn a7(&self) -> u64 {
        match self {
            SbiMessage::Sm(_) => EXT_SM,
            SbiMessage::SmCreate { .. } => EXT_SM_CREATE,
        }
    }

    /// Loads a0-a7 with this call, the way a caller does before `ecall`.
    pub fn write_regs(&self, gprs: &mut GeneralPurposeRegisters) {
        use GprIndex::*;
        match self {
            SbiMessage::Sm(f) => {
                let args = f.args();
                let regs = gprs.a_regs_mut();
                regs[..6].copy_from_slice(&args);
                regs[6] = f.a6();
            }
            SbiMessage::SmCreate { cpu_id } => gprs.set_reg(A1, *cpu_id),
        }
        gprs.set_reg(A7, self.a7());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs_for(a: [u64; 8]) -> GeneralPurposeRegisters {
        let mut gprs = GeneralPurposeRegisters::default();
        gprs.a_regs_mut().copy_from_slice(&a);
        gprs
    }

    #[test]
    fn parse_sm_functions() {
        let gprs = regs_for([1, 0x8100_0000, 0x8000_0000_0000_00cf, 1, 0, 0, 2, EXT_SM]);
        assert_eq!(
            SbiMessage::from_regs(&gprs),
            Ok(SbiMessage::Sm(SmFunction::SetPte {
                op: SetPteOp::Clear,
                addr: 0x8100_0000,
                value: 0x8000_0000_0000_00cf,
                size: 1,
            }))
        );
        let gprs = regs_for([0, 0, 0, 0, 0, 0, 3, EXT_SM]);
        assert_eq!(
            SbiMessage::from_regs(&gprs),
            Ok(SbiMessage::Sm(SmFunction::MonitorInit))
        );
        let gprs = regs_for([3, 0, 0, 0, 0, 0, 2, EXT_SM]);
        assert_eq!(SbiMessage::from_regs(&gprs), Err(Error::InvalidParam));
        let gprs = regs_for([0, 0, 0, 0, 0, 0, 9, EXT_SM]);
        assert_eq!(SbiMessage::from_regs(&gprs), Err(Error::NotSupported));
        let gprs = regs_for([0, 0, 0, 0, 0, 0, 0, 0x10]);
        assert_eq!(SbiMessage::from_regs(&gprs), Err(Error::NotSupported));
    }

    #[test]
    fn create_takes_cpu_from_a1() {
        let gprs = regs_for([7, 2, 0, 0, 0, 0, 0, EXT_SM_CREATE]);
        assert_eq!(
            SbiMessage::from_regs(&gprs),
            Ok(SbiMessage::SmCreate { cpu_id: 2 })
        );
        assert!(is_monitor_extension(EXT_SM_CREATE));
        assert!(!is_monitor_extension(0x735049));
    }

    #[test]
    fn write_then_parse() {
        let msg = SbiMessage::Sm(SmFunction::BitmapAndHptInit {
            bitmap_base: 1,
            bitmap_size: 2,
            hpt_base: 3,
            hpt_size: 4,
            pmd_base: 5,
            pte_base: 6,
        });
        let mut gprs = GeneralPurposeRegisters::default();
        msg.write_regs(&mut gprs);
        assert_eq!(gprs.reg(GprIndex::A6), 1);
        assert_eq!(SbiMessage::from_regs(&gprs), Ok(msg));
    }

    #[test]
    fn return_codes() {
        assert_eq!(SbiReturn::from(Err(Error::Denied)).error_code, -4);
        assert_eq!(SbiReturn::from(Ok(5)).into_result(), Ok(5));
        assert_eq!(
            SbiReturn::from(Error::InsufficientBufferCapacity).into_result(),
            Err(Error::InsufficientBufferCapacity)
        );
        assert_eq!(Error::from_code(-42), Error::Failed);
    }
}
