// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Emulation of the address-translation instructions HS mode executes while `mstatus.TVM` is set.

use riscv_pages::Pfn;
use riscv_regs::{
    satp, CsrInstruction, CsrSource, Exception, LocalRegisterCopy, MachineCsr, TranslationFence,
    TrapFrame, CSR_HGATP, CSR_SATP,
};

use crate::hart::{HartCsrs, Platform};
use crate::monitor::SecurityMonitor;
use crate::trap::{redirect_to_hypervisor, TrapInfo, TrapOutcome};

impl<P: Platform> SecurityMonitor<P> {
    /// Emulates the `satp`/`hgatp` access or translation fence in `trap.tval`.
    pub(crate) fn emulate_tvm<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        trap: &TrapInfo,
    ) -> TrapOutcome {
        let raw = trap.tval as u32;
        if let Some(fence) = TranslationFence::from_raw(raw) {
            let gprs = &frame.gprs;
            match fence {
                // sinval.vma is only a finer-grained sfence.vma.
                TranslationFence::SfenceVma { rs1, rs2 } | TranslationFence::SinvalVma { rs1, rs2 } => {
                    hart.sfence_vma(gprs.reg(rs1), gprs.reg(rs2))
                }
                TranslationFence::HfenceGvma { rs1, rs2 } => {
                    hart.hfence_gvma(gprs.reg(rs1), gprs.reg(rs2))
                }
                TranslationFence::HfenceVvma { rs1, rs2 } => {
                    hart.hfence_vvma(gprs.reg(rs1), gprs.reg(rs2))
                }
            }
            frame.mepc += 4;
            return TrapOutcome::Handled;
        }

        let csr = match CsrInstruction::from_raw(raw) {
            Some(csr) => csr,
            None => return TrapOutcome::NotHandled,
        };
        let target = match csr.csr {
            CSR_SATP => MachineCsr::Satp,
            CSR_HGATP => MachineCsr::Hgatp,
            _ => return TrapOutcome::NotHandled,
        };

        let old = hart.read_csr(target);
        if csr.writes_csr() {
            let operand = match csr.source {
                CsrSource::Register(r) => frame.gprs.reg(r),
                CsrSource::Immediate(imm) => imm,
            };
            let new = csr.apply(old, operand);
            // Guest-stage tables aren't monitored, so any hgatp is taken.
            if target == MachineCsr::Satp && !self.accepts_satp(new) {
                let illegal = TrapInfo {
                    cause: Exception::IllegalInstruction as u64,
                    tval: trap.tval,
                    epc: frame.mepc,
                    ..TrapInfo::default()
                };
                redirect_to_hypervisor(hart, frame, &illegal);
                return TrapOutcome::Handled;
            }
            hart.write_csr(target, new);
        }
        frame.gprs.set_reg(csr.rd, old);
        frame.mepc += 4;
        TrapOutcome::Handled
    }

    // Returns true if HS mode may switch to the translation described by `value`.
    fn accepts_satp(&self, value: u64) -> bool {
        let satp = LocalRegisterCopy::<u64, satp::Register>::new(value);
        if satp.matches_all(satp::mode::Bare) {
            return true;
        }
        let root = Pfn::new(satp.read(satp::ppn));
        self.lock_pages().guard.accepts_root(root)
    }
}
