// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use riscv_regs::{GprIndex, TrapFrame};
use sbi::{Error as SbiError, SbiMessage, SbiReturn, SmFunction};

use crate::hart::{HartCsrs, Platform};
use crate::monitor::{self, SecurityMonitor};

/// Who made an SM call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Caller {
    /// HS mode.
    Hypervisor,
    /// A guest running on a vCPU.
    Guest,
}

#[derive(Clone, Copy, Debug)]
enum EcallAction {
    /// Return to the caller with the result in a0/a1.
    Continue(SbiReturn),
    /// Return to the caller with its registers untouched.
    KeepRegisters,
    /// The frame was loaded with a vCPU and already points into the guest.
    EnterGuest,
}

impl From<monitor::Result<u64>> for EcallAction {
    fn from(result: monitor::Result<u64>) -> EcallAction {
        EcallAction::Continue(result.map_err(SbiError::from).into())
    }
}

impl From<monitor::Result<()>> for EcallAction {
    fn from(result: monitor::Result<()>) -> EcallAction {
        result.map(|()| 0u64).into()
    }
}

impl EcallAction {
    // Calls that leave a0/a1 alone on success.
    fn or_fail(result: monitor::Result<()>, success: EcallAction) -> EcallAction {
        match result {
            Ok(()) => success,
            Err(e) => EcallAction::Continue(SbiError::from(e).into()),
        }
    }
}

impl<P: Platform> SecurityMonitor<P> {
    /// Handles an SM call made with `ecall` from `caller`. The result goes in a0/a1 and `mepc`
    /// moves past the `ecall`, unless the call entered a guest.
    pub(crate) fn handle_ecall<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        caller: Caller,
    ) {
        let action = match SbiMessage::from_regs(&frame.gprs) {
            Ok(msg) => self.handle_sm_msg(hart, frame, caller, msg),
            Err(e) => EcallAction::Continue(e.into()),
        };
        match action {
            EcallAction::Continue(sbi_ret) => {
                frame.gprs.set_reg(GprIndex::A0, sbi_ret.error_code as u64);
                frame.gprs.set_reg(GprIndex::A1, sbi_ret.return_value);
                frame.mepc += 4;
            }
            EcallAction::KeepRegisters => frame.mepc += 4,
            EcallAction::EnterGuest => (),
        }
    }

    fn handle_sm_msg<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        caller: Caller,
        msg: SbiMessage,
    ) -> EcallAction {
        let guest_call = matches!(msg, SbiMessage::Sm(f) if f.is_guest_call());
        if guest_call != (caller == Caller::Guest) {
            return EcallAction::Continue(SbiError::Denied.into());
        }
        match msg {
            SbiMessage::SmCreate { cpu_id } => {
                EcallAction::or_fail(
                    self.create_cpu(hart, frame, cpu_id),
                    EcallAction::KeepRegisters,
                )
            }
            SbiMessage::Sm(f) => self.handle_sm_function(hart, frame, f),
        }
    }

    fn handle_sm_function<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        f: SmFunction,
    ) -> EcallAction {
        use SmFunction::*;
        match f {
            SetShared { paddr, size } => self.set_shared(paddr, size).into(),
            SetPrivate { paddr, size } => self.set_private(paddr, size).into(),
            BitmapAndHptInit {
                bitmap_base,
                bitmap_size,
                hpt_base,
                hpt_size,
                pmd_base,
                pte_base,
            } => self
                .bitmap_and_hpt_init(
                    hart,
                    frame,
                    bitmap_base,
                    bitmap_size,
                    hpt_base,
                    hpt_size,
                    pmd_base,
                    pte_base,
                )
                .into(),
            SetPte {
                op,
                addr,
                value,
                size,
            } => self.set_pte(op, addr, value, size).into(),
            MonitorInit => self.monitor_init(hart, frame).into(),
            ReverseMapInit { base, size } => self
                .reverse_map_init(hart, frame, base, size)
                .into(),
            PrepareMmio { cpu_id } => self.prepare_mmio(hart, cpu_id).into(),
            ResumeCpu { cpu_id, ret0, ret1 } => {
                EcallAction::or_fail(
                    self.resume_cpu(hart, frame, cpu_id, ret0, ret1),
                    EcallAction::EnterGuest,
                )
            }
            SetBounceBuffer { gpa, size } => self.set_bounce_buffer(hart, gpa, size).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::*;
    use crate::trap::{TrapInfo, TrapOutcome};
    use page_tracking::PageClass;
    use riscv_pages::Pfn;
    use riscv_regs::{
        hstatus, mstatus, Exception, GeneralPurposeRegisters, LocalRegisterCopy, MachineCsr,
    };
    use sbi::{SetPteOp, EXT_SM};

    const HS_EPC: u64 = 0x8020_4000;
    const GUEST_EPC: u64 = 0x1_0000;

    fn hs_call(msg: SbiMessage) -> TrapFrame {
        let mut frame = TrapFrame {
            mepc: HS_EPC,
            mstatus: hs_status(),
            ..Default::default()
        };
        msg.write_regs(&mut frame.gprs);
        frame
    }

    fn guest_status() -> u64 {
        let mut status = LocalRegisterCopy::<u64, mstatus::Register>::new(0);
        status.modify(mstatus::mpv::SET + mstatus::mpp::Supervisor);
        status.get()
    }

    fn guest_call(msg: SbiMessage) -> TrapFrame {
        let mut frame = TrapFrame {
            mepc: GUEST_EPC,
            mstatus: guest_status(),
            ..Default::default()
        };
        msg.write_regs(&mut frame.gprs);
        frame
    }

    fn ecall<H: HartCsrs>(
        sm: &SecurityMonitor<FakePlatform>,
        hart: &mut H,
        frame: &mut TrapFrame,
    ) -> TrapOutcome {
        let cause = if frame.mstatus & mstatus::mpv::SET.value != 0 {
            Exception::VirtualSupervisorEnvCall
        } else {
            Exception::SupervisorEnvCall
        };
        let trap = TrapInfo::new(frame, cause as u64, 0, 0, 0);
        sm.handle_trap(hart, frame, &trap)
    }

    fn result(frame: &TrapFrame) -> sbi::Result<u64> {
        SbiReturn {
            error_code: frame.gprs.reg(GprIndex::A0) as i64,
            return_value: frame.gprs.reg(GprIndex::A1),
        }
        .into_result()
    }

    #[test]
    fn boot_sequence() {
        let sm = SecurityMonitor::new(single_hart_config(), FakePlatform::new()).unwrap();
        let mut hart = FakeHart::new(0);

        let mut frame = hs_call(SbiMessage::Sm(SmFunction::BitmapAndHptInit {
            bitmap_base: BITMAP_BASE,
            bitmap_size: BITMAP_SIZE,
            hpt_base: HPT_BASE,
            hpt_size: HPT_SIZE,
            pmd_base: PMD_BASE,
            pte_base: PTE_BASE,
        }));
        assert_eq!(ecall(&sm, &mut hart, &mut frame), TrapOutcome::Handled);
        assert_eq!(result(&frame), Ok(0));
        assert_eq!(frame.mepc, HS_EPC + 4);

        let mut frame = hs_call(SbiMessage::Sm(SmFunction::MonitorInit));
        ecall(&sm, &mut hart, &mut frame);
        let tvm = mstatus::tvm::SET.value;
        assert_eq!(result(&frame), Ok(hs_status() | tvm));
        assert_eq!(frame.mstatus & tvm, tvm);

        let mut frame = hs_call(SbiMessage::Sm(SmFunction::SetPte {
            op: SetPteOp::SetOne,
            addr: HPT_BASE + HPT_SIZE,
            value: 0,
            size: 1,
        }));
        ecall(&sm, &mut hart, &mut frame);
        assert_eq!(result(&frame), Err(SbiError::InvalidAddress));

        let mut frame = hs_call(SbiMessage::Sm(SmFunction::SetPrivate {
            paddr: DRAM_BASE + 0x1e_0000,
            size: 0x1000,
        }));
        ecall(&sm, &mut hart, &mut frame);
        assert_eq!(result(&frame), Ok(0));
        assert_eq!(
            sm.lock_pages()
                .guard
                .bitmap()
                .class(Pfn::from_addr(DRAM_BASE + 0x1e_0000)),
            Ok(PageClass::Private)
        );
    }

    #[test]
    fn bad_calls() {
        let (sm, mut hart) = initialized_monitor();
        // Unknown function id.
        let mut frame = hs_call(SbiMessage::Sm(SmFunction::MonitorInit));
        frame.gprs.set_reg(GprIndex::A6, 42);
        ecall(&sm, &mut hart, &mut frame);
        assert_eq!(result(&frame), Err(SbiError::NotSupported));
        assert_eq!(frame.mepc, HS_EPC + 4);

        // Bounce buffers are set up by guests only.
        let mut frame = hs_call(SbiMessage::Sm(SmFunction::SetBounceBuffer {
            gpa: 0x1000_0000,
            size: 0x1000,
        }));
        ecall(&sm, &mut hart, &mut frame);
        assert_eq!(result(&frame), Err(SbiError::Denied));

        // Guests can't reclassify memory.
        let mut frame = guest_call(SbiMessage::Sm(SmFunction::SetShared {
            paddr: DRAM_BASE,
            size: 0x1000,
        }));
        ecall(&sm, &mut hart, &mut frame);
        assert_eq!(result(&frame), Err(SbiError::Denied));
        assert_eq!(frame.mepc, GUEST_EPC + 4);

        // No vCPU runs on this hart.
        let mut frame = guest_call(SbiMessage::Sm(SmFunction::SetBounceBuffer {
            gpa: 0x1000_0000,
            size: 0x1000,
        }));
        ecall(&sm, &mut hart, &mut frame);
        assert_eq!(result(&frame), Err(SbiError::AlreadyStopped));
    }

    #[test]
    fn other_extensions_left_to_firmware() {
        let (sm, mut hart) = initialized_monitor();
        let mut frame = hs_call(SbiMessage::Sm(SmFunction::MonitorInit));
        frame.gprs.set_reg(GprIndex::A7, 0x10);
        assert_eq!(ecall(&sm, &mut hart, &mut frame), TrapOutcome::NotHandled);
        assert_eq!(frame.mepc, HS_EPC);
    }

    #[test]
    fn guest_ecall_round_trip() {
        let (sm, mut hart) = initialized_monitor();
        hart.write_csr(MachineCsr::Hgatp, guest_hgatp(4));
        hart.write_csr(MachineCsr::Stvec, 0x8020_0000);

        // The hypervisor creates vCPU 1 from its own registers and enters it.
        let mut frame = hs_call(SbiMessage::SmCreate { cpu_id: 1 });
        frame.gprs.set_reg(GprIndex::S1, 0x5151);
        let initial = frame.gprs;
        ecall(&sm, &mut hart, &mut frame);
        assert_eq!(frame.gprs, initial);
        hart.write_csr(MachineCsr::Sepc, GUEST_EPC);
        let mut frame = hs_call(SbiMessage::Sm(SmFunction::ResumeCpu {
            cpu_id: 1,
            ret0: 0,
            ret1: 0,
        }));
        ecall(&sm, &mut hart, &mut frame);
        assert_eq!(frame.gprs, initial);
        assert_eq!(frame.mepc, GUEST_EPC);

        // The guest makes a call the hypervisor handles.
        let mut guest = guest_call(SbiMessage::Sm(SmFunction::MonitorInit));
        guest.gprs.set_reg(GprIndex::A7, 0x10);
        guest.gprs.set_reg(GprIndex::S1, 0x5252);
        let guest_gprs: GeneralPurposeRegisters = guest.gprs;
        assert_eq!(ecall(&sm, &mut hart, &mut guest), TrapOutcome::Handled);
        assert_eq!(guest.mepc, 0x8020_0000);
        assert_eq!(guest.gprs.reg(GprIndex::A7), 0x10);
        assert_eq!(guest.gprs.reg(GprIndex::S1), 0);
        assert_eq!(hart.read_csr(MachineCsr::Hgatp), 4 << 44);

        // The hypervisor answers through ResumeCpu, past the guest's ecall.
        hart.write_csr(MachineCsr::Sepc, GUEST_EPC + 4);
        let mut frame = hs_call(SbiMessage::Sm(SmFunction::ResumeCpu {
            cpu_id: 1,
            ret0: 0,
            ret1: 0x99,
        }));
        frame.mstatus = guest.mstatus;
        ecall(&sm, &mut hart, &mut frame);
        let mut expected = guest_gprs;
        expected.set_reg(GprIndex::A0, 0);
        expected.set_reg(GprIndex::A1, 0x99);
        assert_eq!(frame.gprs, expected);
        assert_eq!(frame.mepc, GUEST_EPC + 4);
        let status = LocalRegisterCopy::<u64, mstatus::Register>::new(frame.mstatus);
        assert!(status.is_set(mstatus::mpv));
        assert!(status.matches_all(mstatus::mpp::Supervisor));
        assert_eq!(hart.read_csr(MachineCsr::Hgatp), guest_hgatp(4));
    }

    #[test]
    fn resume_returns_to_guest_mode() {
        let (sm, mut hart) = initialized_monitor();
        hart.write_csr(MachineCsr::Hgatp, guest_hgatp(3));
        let mut frame = hs_call(SbiMessage::Sm(SmFunction::MonitorInit));
        ecall(&sm, &mut hart, &mut frame);
        let enabled_status = frame.mstatus;

        let mut frame = hs_call(SbiMessage::SmCreate { cpu_id: 0 });
        frame.gprs.set_reg(GprIndex::S1, 0x5ec7e7);
        ecall(&sm, &mut hart, &mut frame);
        assert_eq!(frame.mepc, HS_EPC + 4);

        hart.write_csr(MachineCsr::Sepc, GUEST_EPC);
        hart.write_csr(
            MachineCsr::Hstatus,
            (hstatus::spv::SET + hstatus::spvp::Supervisor).value,
        );
        let mut frame = hs_call(SbiMessage::Sm(SmFunction::ResumeCpu {
            cpu_id: 0,
            ret0: 0,
            ret1: 0,
        }));
        frame.mstatus = enabled_status | mstatus::spp::Supervisor.value;
        ecall(&sm, &mut hart, &mut frame);

        // The guest's registers only ever reach V mode.
        assert_eq!(frame.gprs.reg(GprIndex::S1), 0x5ec7e7);
        assert_eq!(frame.mepc, GUEST_EPC);
        let status = LocalRegisterCopy::<u64, mstatus::Register>::new(frame.mstatus);
        assert!(status.is_set(mstatus::mpv));
        assert!(status.matches_all(mstatus::mpp::Supervisor));
        assert!(!status.is_set(mstatus::tvm));
        assert!(!status.is_set(mstatus::tsr));
        let hs = LocalRegisterCopy::<u64, hstatus::Register>::new(
            hart.read_csr(MachineCsr::Hstatus),
        );
        assert!(!hs.is_set(hstatus::spv));

        // A failed resume returns to the hypervisor with the error.
        let mut frame = hs_call(SbiMessage::Sm(SmFunction::ResumeCpu {
            cpu_id: 0,
            ret0: 0,
            ret1: 0,
        }));
        ecall(&sm, &mut hart, &mut frame);
        assert_eq!(result(&frame), Err(SbiError::AlreadyStarted));
        assert_eq!(frame.mepc, HS_EPC + 4);
        assert!(!LocalRegisterCopy::<u64, mstatus::Register>::new(frame.mstatus)
            .is_set(mstatus::mpv));
    }

    #[test]
    fn guest_bounce_buffer() {
        let (sm, mut hart) = enabled_monitor();
        let (gpa, hpa) = map_guest_pages(sm.platform(), 1);
        hart.write_csr(MachineCsr::Hgatp, guest_hgatp(6));
        let mut frame = hs_call(SbiMessage::SmCreate { cpu_id: 0 });
        ecall(&sm, &mut hart, &mut frame);
        let mut frame = hs_call(SbiMessage::Sm(SmFunction::ResumeCpu {
            cpu_id: 0,
            ret0: 0,
            ret1: 0,
        }));
        ecall(&sm, &mut hart, &mut frame);

        let mut guest = guest_call(SbiMessage::Sm(SmFunction::SetBounceBuffer {
            gpa,
            size: 0x1000,
        }));
        assert_eq!(guest.gprs.reg(GprIndex::A7), EXT_SM);
        assert_eq!(ecall(&sm, &mut hart, &mut guest), TrapOutcome::Handled);
        assert_eq!(result(&guest), Ok(0));
        assert_eq!(guest.mepc, GUEST_EPC + 4);
        assert_eq!(
            sm.lock_pages().guard.bitmap().class(Pfn::from_addr(hpa)),
            Ok(PageClass::Shared)
        );
    }
}
