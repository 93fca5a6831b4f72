// Copyright (c) 2021 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Routing of the traps taken by M mode, and reflection of traps to HS and VS mode.

use m_mode_utils::abort::halt;
use m_mode_utils::{print, println, sm_println};
use riscv_regs::{
    hstatus, mcause, mstatus, tvec, vsstatus, Exception, GprIndex, Interrupt, LocalRegisterCopy,
    MachineCsr, Trap, TrapFrame, TvecHelpers, GUEST_EXIT_EXCEPTIONS, SRET_INSTRUCTION,
};
use sbi::is_monitor_extension;

use crate::ecall::Caller;
use crate::hart::{HartCsrs, Platform};
use crate::monitor::SecurityMonitor;
use crate::vm_cpu;

/// What the monitor did with a trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// The frame is ready to return with `mret`.
    Handled,
    /// The trap is not the monitor's; the firmware handles it.
    NotHandled,
}

/// The trap CSRs of one trap into M mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapInfo {
    pub cause: u64,
    pub tval: u64,
    pub tval2: u64,
    pub tinst: u64,
    /// `tval` holds a guest virtual address.
    pub gva: bool,
    pub epc: u64,
}

impl TrapInfo {
    /// Collects the trap state left by the hardware. `frame` holds `mepc` and `mstatus` as saved
    /// on trap entry.
    pub fn new(frame: &TrapFrame, mcause: u64, mtval: u64, mtval2: u64, mtinst: u64) -> Self {
        let status = LocalRegisterCopy::<u64, mstatus::Register>::new(frame.mstatus);
        Self {
            cause: mcause,
            tval: mtval,
            tval2: mtval2,
            tinst: mtinst,
            gva: status.is_set(mstatus::gva),
            epc: frame.mepc,
        }
    }
}

// Returns where a trap with `cause` enters a handler whose vector base register holds `xtvec`.
fn trap_vector(xtvec: u64, cause: u64) -> u64 {
    let vector = LocalRegisterCopy::<u64, tvec::Register>::new(xtvec);
    let cause = LocalRegisterCopy::<u64, mcause::Register>::new(cause);
    let base = vector.get_trap_address();
    if vector.matches_all(tvec::mode::Vectored) && cause.is_set(mcause::is_interrupt) {
        base + 4 * cause.read(mcause::code)
    } else {
        base
    }
}

/// Makes the trap described by `trap` look to HS mode as if it had been taken there directly.
pub fn redirect_to_hypervisor<H: HartCsrs>(hart: &mut H, frame: &mut TrapFrame, trap: &TrapInfo) {
    let mut status = LocalRegisterCopy::<u64, mstatus::Register>::new(frame.mstatus);
    let from_guest = status.is_set(mstatus::mpv);
    let from_supervisor = status.matches_all(mstatus::mpp::Supervisor);

    let mut hs = LocalRegisterCopy::<u64, hstatus::Register>::new(hart.read_csr(MachineCsr::Hstatus));
    if from_guest {
        hs.modify(
            hstatus::spv::SET
                + hstatus::spvp.val(from_supervisor as u64)
                + hstatus::gva.val(trap.gva as u64),
        );
        hart.write_csr(MachineCsr::Htval, trap.tval2);
        hart.write_csr(MachineCsr::Htinst, trap.tinst);
    } else {
        hs.modify(hstatus::spv::CLEAR);
    }
    hart.write_csr(MachineCsr::Hstatus, hs.get());

    hart.write_csr(MachineCsr::Stval, trap.tval);
    hart.write_csr(MachineCsr::Sepc, trap.epc);
    hart.write_csr(MachineCsr::Scause, trap.cause);
    frame.mepc = trap_vector(hart.read_csr(MachineCsr::Stvec), trap.cause);

    let sie = status.is_set(mstatus::sie);
    status.modify(
        mstatus::mpp::Supervisor
            + mstatus::mpv::CLEAR
            + mstatus::spp.val(from_supervisor as u64)
            + mstatus::spie.val(sie as u64)
            + mstatus::sie::CLEAR,
    );
    frame.mstatus = status.get();
}

/// Delivers `trap`, taken from V mode, to the guest's own trap handler.
pub fn redirect_to_guest<H: HartCsrs>(hart: &mut H, frame: &mut TrapFrame, trap: &TrapInfo) {
    let mut status = LocalRegisterCopy::<u64, mstatus::Register>::new(frame.mstatus);
    let from_supervisor = status.matches_all(mstatus::mpp::Supervisor);

    hart.write_csr(MachineCsr::Vstval, trap.tval);
    hart.write_csr(MachineCsr::Vsepc, trap.epc);
    hart.write_csr(MachineCsr::Vscause, trap.cause);
    frame.mepc = trap_vector(hart.read_csr(MachineCsr::Vstvec), trap.cause);

    let mut vs =
        LocalRegisterCopy::<u64, vsstatus::Register>::new(hart.read_csr(MachineCsr::Vsstatus));
    let sie = vs.is_set(vsstatus::sie);
    vs.modify(
        vsstatus::spp.val(from_supervisor as u64)
            + vsstatus::spie.val(sie as u64)
            + vsstatus::sie::CLEAR,
    );
    hart.write_csr(MachineCsr::Vsstatus, vs.get());

    status.modify(mstatus::mpp::Supervisor);
    frame.mstatus = status.get();
}

/// Completes the `sret` the hypervisor would use to enter a guest: the frame returns to `sepc`
/// in V mode, at the privilege held in `sstatus.SPP`.
pub fn return_to_guest<H: HartCsrs>(hart: &mut H, frame: &mut TrapFrame) {
    let mut status = LocalRegisterCopy::<u64, mstatus::Register>::new(frame.mstatus);
    let mpp = if status.matches_all(mstatus::spp::Supervisor) {
        mstatus::mpp::Supervisor
    } else {
        mstatus::mpp::User
    };
    let spie = status.is_set(mstatus::spie);
    status.modify(
        mpp + mstatus::mpv::SET
            + mstatus::sie.val(spie as u64)
            + mstatus::spie::SET
            + mstatus::spp::User,
    );
    frame.mstatus = status.get();

    let mut hs = LocalRegisterCopy::<u64, hstatus::Register>::new(hart.read_csr(MachineCsr::Hstatus));
    hs.modify(hstatus::spv::CLEAR);
    hart.write_csr(MachineCsr::Hstatus, hs.get());
    frame.mepc = hart.read_csr(MachineCsr::Sepc);
}

fn dump_trap(hart_id: usize, frame: &TrapFrame, trap: &TrapInfo) {
    match Trap::from_mcause(trap.cause) {
        Ok(t) => sm_println!(hart_id, "fatal trap: {:?}", t),
        Err(_) => sm_println!(hart_id, "fatal trap: unknown cause 0x{:x}", trap.cause),
    }
    println!(
        "tval 0x{:016x} tval2 0x{:016x} tinst 0x{:016x}",
        trap.tval, trap.tval2, trap.tinst
    );
    println!(
        "mepc 0x{:016x} mstatus 0x{:016x}",
        frame.mepc, frame.mstatus
    );
    for regs in GprIndex::ALL.chunks(4) {
        for r in regs {
            print!("{:>4}: 0x{:016x} ", r.name(), frame.gprs.reg(*r));
        }
        println!();
    }
}

/// Prints the state of an unrecoverable trap and stops the hart.
pub fn fatal_trap(hart_id: usize, frame: &TrapFrame, trap: &TrapInfo) -> ! {
    dump_trap(hart_id, frame, trap);
    halt()
}

fn is_supervisor_interrupt(interrupt: Interrupt) -> bool {
    use Interrupt::*;
    matches!(
        interrupt,
        SupervisorSoft | SupervisorTimer | SupervisorExternal
    )
}

impl<P: Platform> SecurityMonitor<P> {
    /// The monitor's entry point for every trap into M mode. `frame` is the state saved by the
    /// firmware's trap entry and `trap` the trap CSRs read on entry.
    pub fn handle_trap<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        trap: &TrapInfo,
    ) -> TrapOutcome {
        let cause = match Trap::from_mcause(trap.cause) {
            Ok(cause) => cause,
            Err(_) => return TrapOutcome::NotHandled,
        };
        let status = LocalRegisterCopy::<u64, mstatus::Register>::new(frame.mstatus);
        if status.is_set(mstatus::mpv) {
            return self.handle_guest_trap(hart, frame, trap, cause);
        }
        if !status.matches_all(mstatus::mpp::Supervisor) {
            return TrapOutcome::NotHandled;
        }

        match cause {
            Trap::Exception(Exception::IllegalInstruction) => {
                self.handle_illegal_instruction(hart, frame, trap)
            }
            Trap::Exception(Exception::SupervisorEnvCall)
                if is_monitor_extension(frame.gprs.reg(GprIndex::A7)) =>
            {
                self.handle_ecall(hart, frame, Caller::Hypervisor);
                TrapOutcome::Handled
            }
            _ => TrapOutcome::NotHandled,
        }
    }

    // Traps from VS or VU mode.
    fn handle_guest_trap<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        trap: &TrapInfo,
        cause: Trap,
    ) -> TrapOutcome {
        match cause {
            Trap::Interrupt(i) if is_supervisor_interrupt(i) => {
                self.forward_exit(hart, frame, trap);
                TrapOutcome::Handled
            }
            Trap::Exception(Exception::VirtualSupervisorEnvCall)
                if is_monitor_extension(frame.gprs.reg(GprIndex::A7)) =>
            {
                self.handle_ecall(hart, frame, Caller::Guest);
                TrapOutcome::Handled
            }
            Trap::Exception(e) if hart.read_csr(MachineCsr::Hedeleg) & e.deleg_mask() != 0 => {
                redirect_to_guest(hart, frame, trap);
                TrapOutcome::Handled
            }
            Trap::Exception(e) if GUEST_EXIT_EXCEPTIONS.contains(&e) => {
                self.forward_exit(hart, frame, trap);
                TrapOutcome::Handled
            }
            _ => TrapOutcome::NotHandled,
        }
    }

    // Saves the vCPU running on this hart, if it is tracked, and hands the exit to HS mode.
    fn forward_exit<H: HartCsrs>(&self, hart: &mut H, frame: &mut TrapFrame, trap: &TrapInfo) {
        match self.vcpus().preserve(hart, frame, trap) {
            // Untracked guests exit with their registers intact.
            Ok(()) | Err(vm_cpu::Error::VmCpuNotRunning) => (),
            Err(e) => sm_println!(hart.hart_id(), "guest exit not preserved: {:?}", e),
        }
        redirect_to_hypervisor(hart, frame, trap);
    }

    fn handle_illegal_instruction<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        trap: &TrapInfo,
    ) -> TrapOutcome {
        let tsr = mstatus::tsr::SET.value;
        if trap.tval as u32 == SRET_INSTRUCTION && frame.mstatus & tsr != 0 {
            if let Err(e) = self.vcpus().handle_sret(hart, frame) {
                sm_println!(hart.hart_id(), "sret from HS mode: {:?}", e);
                frame.mstatus &= !tsr;
            }
            return TrapOutcome::Handled;
        }
        if frame.mstatus & mstatus::tvm::SET.value != 0 {
            return self.emulate_tvm(hart, frame, trap);
        }
        TrapOutcome::NotHandled
    }
}
