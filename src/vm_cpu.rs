// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Saved state of confidential vCPUs across the exits the hypervisor handles.
//!
//! A vCPU runs with the exit causes taken back from HS mode. When it exits, `preserve` saves its
//! registers and scrubs the trap frame down to what the hypervisor needs for the exit. When the
//! hypervisor is done, `resume` (or an intercepted `sret`) puts the registers back, replaying the
//! value the hypervisor produced into the register the exit left pending.

use m_mode_utils::sm_println;
use riscv_regs::{
    guest_exit_deleg_mask, hgatp, mstatus, CsrInstruction, DecodedInstruction, Exception,
    GeneralPurposeRegisters, GprIndex, HgatpHelpers, LocalRegisterCopy, MachineCsr,
    MmioOperation, Trap, TrapFrame, MIDELEG_SUPERVISOR_INTERRUPTS,
};
use sync::Mutex;

use crate::hart::HartCsrs;
use crate::trap::{fatal_trap, TrapInfo};
use crate::{MAX_HARTS, MAX_VCPUS, VM_BUCKETS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The vCPU id doesn't fit in a bucket.
    BadCpuId,
    /// The vCPU was already created for this VM.
    VmCpuExists,
    /// No record of the vCPU for this VM.
    VmCpuNotFound,
    /// The vCPU is running on a hart.
    VmCpuRunning,
    /// The hart isn't running a tracked vCPU.
    VmCpuNotRunning,
    /// The hart id is larger than the monitor supports.
    BadHartId(usize),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Trap cause recorded for a vCPU that has been created but never exited.
pub const FIRST_RUN_CAUSE: u64 = u64::MAX;

/// Identifies a vCPU: the VMID of its VM and its index in the VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VcpuKey {
    pub vm_id: u64,
    pub cpu_id: usize,
}

impl VcpuKey {
    /// Returns the key of `cpu_id` in the VM whose `hgatp` is loaded on `hart`.
    pub fn from_live_hgatp<H: HartCsrs>(hart: &H, cpu_id: u64) -> Self {
        let hgatp = LocalRegisterCopy::<u64, hgatp::Register>::new(hart.read_csr(MachineCsr::Hgatp));
        Self {
            vm_id: hgatp.vmid(),
            cpu_id: cpu_id as usize,
        }
    }
}

/// Represents the state of a vCPU record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmCpuStatus {
    /// Created but not resumed yet.
    Created,
    /// Running on a hart.
    Running,
    /// Exited; the hypervisor is handling the exit.
    Forwarding,
}

/// What a hart is doing with respect to tracked vCPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HartVcpuState {
    Idle,
    GuestRunning(VcpuKey),
    Forwarding(VcpuKey),
}

/// Where the value the hypervisor produced for an exit comes from when the vCPU is resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Replay {
    /// Passed to `resume_cpu`: `a0`/`a1` for ecalls, the loaded value for MMIO and CSR reads.
    Explicit { ret0: u64, ret1: u64 },
    /// Left by the hypervisor in the CSR destination register of the frame that executed `sret`.
    FromFrame,
    /// Nothing to replay.
    None,
}

// The exit classes a vCPU record can be resumed from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExitKind {
    FirstRun,
    Ecall,
    Fault,
    GuestPageFault,
    VirtualInstruction,
}

impl ExitKind {
    fn from_cause(cause: u64) -> Option<Self> {
        if cause == FIRST_RUN_CAUSE {
            return Some(ExitKind::FirstRun);
        }
        match Trap::from_mcause(cause).ok()? {
            Trap::Interrupt(_) => Some(ExitKind::Fault),
            Trap::Exception(Exception::VirtualSupervisorEnvCall) => Some(ExitKind::Ecall),
            Trap::Exception(Exception::VirtualInstruction) => Some(ExitKind::VirtualInstruction),
            Trap::Exception(e) if e.is_access_fault() => Some(ExitKind::Fault),
            Trap::Exception(e) if e.is_guest_page_fault() => Some(ExitKind::GuestPageFault),
            _ => None,
        }
    }
}

fn tvm_tsr() -> u64 {
    mstatus::tvm::SET.value | mstatus::tsr::SET.value
}

/// The saved state of one vCPU.
pub struct VmCpuRecord {
    vm_id: u64,
    gprs: GeneralPurposeRegisters,
    trap: TrapInfo,
    csr_rd: Option<GprIndex>,
    medeleg: u64,
    hgatp: u64,
    hgatp_token: u64,
    mmio_next: bool,
    pending_mmio: Option<MmioOperation>,
    bounce_buffer: Option<(u64, u64)>,
    status: VmCpuStatus,
}

impl VmCpuRecord {
    fn new(vm_id: u64, gprs: GeneralPurposeRegisters, full_hgatp: u64) -> Self {
        let token = LocalRegisterCopy::<u64, hgatp::Register>::new(full_hgatp).vmid_only();
        Self {
            vm_id,
            gprs,
            trap: TrapInfo {
                cause: FIRST_RUN_CAUSE,
                ..TrapInfo::default()
            },
            csr_rd: None,
            medeleg: 0,
            hgatp: full_hgatp,
            hgatp_token: token,
            mmio_next: false,
            pending_mmio: None,
            bounce_buffer: None,
            status: VmCpuStatus::Created,
        }
    }

    pub fn status(&self) -> VmCpuStatus {
        self.status
    }

    /// Returns the full `hgatp` the vCPU runs with.
    pub fn hgatp(&self) -> u64 {
        self.hgatp
    }

    /// Returns the `hgatp` value the hypervisor sees while handling an exit: the VMID alone.
    pub fn hgatp_token(&self) -> u64 {
        self.hgatp_token
    }

    pub fn gprs(&self) -> &GeneralPurposeRegisters {
        &self.gprs
    }

    pub fn trap(&self) -> &TrapInfo {
        &self.trap
    }

    pub fn pending_mmio(&self) -> Option<MmioOperation> {
        self.pending_mmio
    }

    /// Requests that the next guest page fault be decoded as an MMIO access.
    pub fn set_mmio_next(&mut self) {
        self.mmio_next = true;
    }

    pub fn bounce_buffer(&self) -> Option<(u64, u64)> {
        self.bounce_buffer
    }

    pub fn set_bounce_buffer(&mut self, gpa: u64, size: u64) {
        self.bounce_buffer = Some((gpa, size));
    }

    // Decodes the faulting access of a guest page fault, leaving the instruction bits in a0 and
    // the value being stored in a1.
    fn expose_mmio<H: HartCsrs>(&mut self, hart: &mut H, frame: &mut TrapFrame, trap: &TrapInfo) {
        let instruction = DecodedInstruction::from_transformed(trap.tinst).or_else(|| {
            hart.fetch_guest_instruction(trap.epc)
                .and_then(|raw| DecodedInstruction::from_raw(raw).ok())
        });
        frame.gprs.clear();
        match instruction.as_ref().and_then(MmioOperation::from_instruction) {
            Some(op) => {
                let store_value = if op.opcode().is_load() {
                    0
                } else {
                    self.gprs.reg(op.register())
                };
                frame.gprs.set_reg(GprIndex::A0, op.raw() as u64);
                frame.gprs.set_reg(GprIndex::A1, store_value);
                self.pending_mmio = Some(op);
            }
            None => {
                sm_println!(
                    hart.hart_id(),
                    "failed to decode MMIO access at 0x{:x}, tinst 0x{:x}",
                    trap.epc,
                    trap.tinst
                );
            }
        }
    }

    // Saves the guest state of an exit and leaves only what the hypervisor needs in `frame`.
    fn save_exit<H: HartCsrs>(&mut self, hart: &mut H, frame: &mut TrapFrame, trap: &TrapInfo) {
        self.gprs = frame.gprs;
        self.trap = *trap;
        self.csr_rd = None;
        self.pending_mmio = None;
        self.status = VmCpuStatus::Forwarding;

        hart.set_csr_bits(MachineCsr::Mideleg, MIDELEG_SUPERVISOR_INTERRUPTS);
        hart.write_csr(MachineCsr::Medeleg, self.medeleg);

        match ExitKind::from_cause(trap.cause) {
            Some(ExitKind::Ecall) => frame.gprs.clear_except_a_regs(),
            Some(ExitKind::GuestPageFault) if self.mmio_next => {
                self.mmio_next = false;
                self.expose_mmio(hart, frame, trap);
            }
            Some(ExitKind::VirtualInstruction) => match CsrInstruction::from_raw(trap.tval as u32) {
                Some(csr) => {
                    self.csr_rd = Some(csr.rd);
                    match csr.rs1() {
                        Some(rs1) => frame.gprs.clear_except(rs1),
                        None => frame.gprs.clear(),
                    }
                }
                None => frame.gprs.clear(),
            },
            _ => frame.gprs.clear(),
        }

        hart.write_csr(MachineCsr::Hgatp, self.hgatp_token);
        frame.mstatus |= tvm_tsr();
    }

    // Writes the value the hypervisor produced for the last exit into the restored registers.
    // `live` holds the registers of the frame before the restore.
    fn replay(
        &mut self,
        kind: ExitKind,
        replay: Replay,
        live: &GeneralPurposeRegisters,
        frame: &mut TrapFrame,
    ) {
        match replay {
            Replay::None => (),
            Replay::FromFrame => {
                if let Some(rd) = self.csr_rd {
                    frame.gprs.set_reg(rd, live.reg(rd));
                }
            }
            Replay::Explicit { ret0, ret1 } => match kind {
                ExitKind::Ecall => {
                    frame.gprs.set_reg(GprIndex::A0, ret0);
                    frame.gprs.set_reg(GprIndex::A1, ret1);
                }
                ExitKind::VirtualInstruction => {
                    if let Some(rd) = self.csr_rd {
                        frame.gprs.set_reg(rd, ret0);
                    }
                }
                ExitKind::GuestPageFault => {
                    if let Some(op) = self.pending_mmio.filter(|op| op.opcode().is_load()) {
                        frame.gprs.set_reg(op.register(), op.opcode().extend(ret0));
                    }
                }
                ExitKind::FirstRun | ExitKind::Fault => (),
            },
        }
        self.csr_rd = None;
        self.pending_mmio = None;
    }
}

type VcpuSlot = Mutex<Option<VmCpuRecord>>;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: VcpuSlot = Mutex::new(None);
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_BUCKET: [VcpuSlot; MAX_VCPUS] = [EMPTY_SLOT; MAX_VCPUS];
#[allow(clippy::declare_interior_mutable_const)]
const IDLE_HART: Mutex<HartVcpuState> = Mutex::new(HartVcpuState::Idle);

/// The vCPU records of every VM, hashed by VMID, and what each hart is running.
///
/// Locking: the creation lock is taken before a slot lock. Hart states are never locked while a
/// slot is held.
pub struct VmCpuTable {
    buckets: [[VcpuSlot; MAX_VCPUS]; VM_BUCKETS],
    create_lock: Mutex<()>,
    harts: [Mutex<HartVcpuState>; MAX_HARTS],
}

impl VmCpuTable {
    pub const fn new() -> Self {
        Self {
            buckets: [EMPTY_BUCKET; VM_BUCKETS],
            create_lock: Mutex::new(()),
            harts: [IDLE_HART; MAX_HARTS],
        }
    }

    fn slot(&self, key: VcpuKey) -> Result<&VcpuSlot> {
        self.buckets[(key.vm_id % VM_BUCKETS as u64) as usize]
            .get(key.cpu_id)
            .ok_or(Error::BadCpuId)
    }

    /// Returns what `hart_id` is currently doing.
    pub fn hart_state(&self, hart_id: usize) -> Result<HartVcpuState> {
        let state = self.harts.get(hart_id).ok_or(Error::BadHartId(hart_id))?;
        Ok(*state.lock())
    }

    fn set_hart_state(&self, hart_id: usize, new: HartVcpuState) -> Result<()> {
        let state = self.harts.get(hart_id).ok_or(Error::BadHartId(hart_id))?;
        *state.lock() = new;
        Ok(())
    }

    /// Returns the vCPU `hart_id` is running, if any.
    pub fn running_vcpu(&self, hart_id: usize) -> Option<VcpuKey> {
        match self.hart_state(hart_id) {
            Ok(HartVcpuState::GuestRunning(key)) => Some(key),
            _ => None,
        }
    }

    /// Creates the record of `cpu_id` in VM `vm_id`, starting from `gprs`. A record of another VM
    /// hashed to the same slot is replaced and its VMID returned.
    pub fn create(
        &self,
        vm_id: u64,
        cpu_id: usize,
        gprs: GeneralPurposeRegisters,
        full_hgatp: u64,
    ) -> Result<Option<u64>> {
        let _creating = self.create_lock.lock();
        let mut slot = self.slot(VcpuKey { vm_id, cpu_id })?.lock();
        let evicted = match slot.as_ref() {
            Some(r) if r.vm_id == vm_id => return Err(Error::VmCpuExists),
            Some(r) => Some(r.vm_id),
            None => None,
        };
        *slot = Some(VmCpuRecord::new(vm_id, gprs, full_hgatp));
        Ok(evicted)
    }

    /// Runs `f` on the record of `key`.
    pub fn with_vcpu<R, F>(&self, key: VcpuKey, f: F) -> Result<R>
    where
        F: FnOnce(&mut VmCpuRecord) -> R,
    {
        let mut slot = self.slot(key)?.lock();
        let record = slot
            .as_mut()
            .filter(|r| r.vm_id == key.vm_id)
            .ok_or(Error::VmCpuNotFound)?;
        Ok(f(record))
    }

    /// Saves the vCPU running on `hart` as it exits with `trap`, scrubbing `frame` for the
    /// hypervisor.
    pub fn preserve<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        trap: &TrapInfo,
    ) -> Result<()> {
        let hart_id = hart.hart_id();
        let key = match self.hart_state(hart_id)? {
            HartVcpuState::GuestRunning(key) => key,
            _ => return Err(Error::VmCpuNotRunning),
        };
        let saved = self.with_vcpu(key, |record| record.save_exit(hart, frame, trap));
        if saved.is_err() {
            // The record was taken over while the vCPU ran. Give the hypervisor its interrupts
            // back and forget the vCPU.
            sm_println!(
                hart_id,
                "vCPU {} of VM {} lost its record",
                key.cpu_id,
                key.vm_id
            );
            hart.set_csr_bits(MachineCsr::Mideleg, MIDELEG_SUPERVISOR_INTERRUPTS);
            self.set_hart_state(hart_id, HartVcpuState::Idle)?;
            return saved;
        }
        self.set_hart_state(hart_id, HartVcpuState::Forwarding(key))
    }

    /// Restores vCPU `cpu_id` of the VM loaded in `hgatp` into `frame`, to be entered when the
    /// hypervisor returns.
    pub fn resume<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        cpu_id: u64,
        replay: Replay,
    ) -> Result<()> {
        let key = VcpuKey::from_live_hgatp(&*hart, cpu_id);
        self.resume_key(hart, frame, key, replay)
    }

    fn resume_key<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        key: VcpuKey,
        replay: Replay,
    ) -> Result<()> {
        let hart_id = hart.hart_id();
        if hart_id >= MAX_HARTS {
            return Err(Error::BadHartId(hart_id));
        }
        let mut slot = self.slot(key)?.lock();
        let record = slot
            .as_mut()
            .filter(|r| r.vm_id == key.vm_id)
            .ok_or(Error::VmCpuNotFound)?;
        if record.status == VmCpuStatus::Running {
            return Err(Error::VmCpuRunning);
        }
        let kind = match ExitKind::from_cause(record.trap.cause) {
            Some(kind) => kind,
            None => fatal_trap(hart_id, frame, &record.trap),
        };

        let live = frame.gprs;
        frame.restore_gprs(&record.gprs);
        record.replay(kind, replay, &live, frame);

        hart.write_csr(MachineCsr::Hgatp, record.hgatp);
        let medeleg = hart.read_csr(MachineCsr::Medeleg);
        record.medeleg = medeleg;
        hart.write_csr(MachineCsr::Medeleg, medeleg & !guest_exit_deleg_mask());
        hart.clear_csr_bits(MachineCsr::Mideleg, MIDELEG_SUPERVISOR_INTERRUPTS);
        frame.mstatus &= !tvm_tsr();
        record.status = VmCpuStatus::Running;
        drop(slot);

        self.set_hart_state(hart_id, HartVcpuState::GuestRunning(key))
    }

    /// Handles an `sret` from HS mode trapped by `mstatus.TSR`. If the hypervisor is returning to
    /// the vCPU from a virtual-instruction exit, either past the instruction or into the guest's
    /// trap vector, the vCPU is resumed. Otherwise TSR is cleared so the `sret` executes when
    /// it is retried, and the hart goes back to idle.
    pub fn handle_sret<H: HartCsrs>(&self, hart: &mut H, frame: &mut TrapFrame) -> Result<()> {
        let hart_id = hart.hart_id();
        if let HartVcpuState::Forwarding(key) = self.hart_state(hart_id)? {
            let sepc = hart.read_csr(MachineCsr::Sepc);
            let vstvec = hart.read_csr(MachineCsr::Vstvec);
            let replay = self
                .with_vcpu(key, |record| {
                    if ExitKind::from_cause(record.trap.cause) != Some(ExitKind::VirtualInstruction)
                    {
                        None
                    } else if sepc == record.trap.epc.wrapping_add(4) {
                        Some(Replay::FromFrame)
                    } else if sepc == vstvec {
                        Some(Replay::None)
                    } else {
                        None
                    }
                })
                .ok()
                .flatten();
            if let Some(replay) = replay {
                return self.resume_key(hart, frame, key, replay);
            }
        }
        frame.mstatus &= !mstatus::tsr::SET.value;
        self.set_hart_state(hart_id, HartVcpuState::Idle)
    }
}

impl Default for VmCpuTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::*;

    const VMID: u64 = 5;

    fn guest_gprs() -> GeneralPurposeRegisters {
        let mut gprs = GeneralPurposeRegisters::default();
        for (i, r) in GprIndex::ALL.iter().enumerate() {
            gprs.set_reg(*r, 0x1000 + i as u64);
        }
        gprs
    }

    fn key(cpu_id: usize) -> VcpuKey {
        VcpuKey {
            vm_id: VMID,
            cpu_id,
        }
    }

    fn trap(cause: u64, tval: u64, tinst: u64) -> TrapInfo {
        TrapInfo {
            cause,
            tval,
            tval2: 0,
            tinst,
            gva: false,
            epc: 0x1_0000,
        }
    }

    // Creates vCPU 0 and runs it on `hart`, leaving the guest registers in the returned frame.
    fn running_vcpu(table: &VmCpuTable, hart: &mut FakeHart) -> TrapFrame {
        hart.write_csr(MachineCsr::Hgatp, guest_hgatp(VMID));
        table.create(VMID, 0, guest_gprs(), guest_hgatp(VMID)).unwrap();
        let mut frame = TrapFrame::default();
        table.resume(hart, &mut frame, 0, Replay::None).unwrap();
        frame
    }

    #[test]
    fn create_records() {
        let table = VmCpuTable::new();
        assert_eq!(
            table.create(VMID, MAX_VCPUS, guest_gprs(), 0),
            Err(Error::BadCpuId)
        );
        assert_eq!(table.create(VMID, 1, guest_gprs(), guest_hgatp(VMID)), Ok(None));
        assert_eq!(
            table.create(VMID, 1, guest_gprs(), guest_hgatp(VMID)),
            Err(Error::VmCpuExists)
        );
        // VMID 13 hashes to the same bucket and takes the slot over.
        let other = VMID + VM_BUCKETS as u64;
        assert_eq!(
            table.create(other, 1, guest_gprs(), guest_hgatp(other)),
            Ok(Some(VMID))
        );
        assert_eq!(
            table.with_vcpu(key(1), |r| r.status()),
            Err(Error::VmCpuNotFound)
        );
        let token = table
            .with_vcpu(
                VcpuKey {
                    vm_id: other,
                    cpu_id: 1,
                },
                |r| (r.status(), r.hgatp_token(), r.trap().cause),
            )
            .unwrap();
        assert_eq!(token, (VmCpuStatus::Created, other << 44, FIRST_RUN_CAUSE));
    }

    #[test]
    fn resume_enters_guest() {
        let table = VmCpuTable::new();
        let mut hart = FakeHart::new(1);
        hart.write_csr(MachineCsr::Medeleg, 0xffff);
        hart.write_csr(MachineCsr::Mideleg, MIDELEG_SUPERVISOR_INTERRUPTS);
        let frame = running_vcpu(&table, &mut hart);

        assert_eq!(frame.gprs, guest_gprs());
        assert_eq!(frame.mstatus & tvm_tsr(), 0);
        assert_eq!(hart.read_csr(MachineCsr::Hgatp), guest_hgatp(VMID));
        assert_eq!(
            hart.read_csr(MachineCsr::Medeleg),
            0xffff & !guest_exit_deleg_mask()
        );
        assert_eq!(hart.read_csr(MachineCsr::Mideleg), 0);
        assert_eq!(
            table.hart_state(1),
            Ok(HartVcpuState::GuestRunning(key(0)))
        );
        assert_eq!(table.running_vcpu(1), Some(key(0)));
        assert_eq!(
            table.resume(&mut hart, &mut TrapFrame::default(), 0, Replay::None),
            Err(Error::VmCpuRunning)
        );
        assert_eq!(
            table.resume(&mut hart, &mut TrapFrame::default(), 3, Replay::None),
            Err(Error::VmCpuNotFound)
        );
    }

    #[test]
    fn ecall_exit_keeps_arguments() {
        let table = VmCpuTable::new();
        let mut hart = FakeHart::new(0);
        hart.write_csr(MachineCsr::Medeleg, 0xffff);
        let mut frame = running_vcpu(&table, &mut hart);

        let cause = Exception::VirtualSupervisorEnvCall as u64;
        table.preserve(&mut hart, &mut frame, &trap(cause, 0, 0)).unwrap();
        assert_eq!(frame.gprs.reg(GprIndex::A0), guest_gprs().reg(GprIndex::A0));
        assert_eq!(frame.gprs.reg(GprIndex::A7), guest_gprs().reg(GprIndex::A7));
        assert_eq!(frame.gprs.reg(GprIndex::S0), 0);
        assert_eq!(frame.gprs.reg(GprIndex::SP), 0);
        assert_eq!(frame.mstatus & tvm_tsr(), tvm_tsr());
        assert_eq!(hart.read_csr(MachineCsr::Hgatp), VMID << 44);
        assert_eq!(hart.read_csr(MachineCsr::Medeleg), 0xffff);
        assert_eq!(
            hart.read_csr(MachineCsr::Mideleg),
            MIDELEG_SUPERVISOR_INTERRUPTS
        );
        assert_eq!(table.hart_state(0), Ok(HartVcpuState::Forwarding(key(0))));

        // A second exit can't be preserved without resuming first.
        assert_eq!(
            table.preserve(&mut hart, &mut frame, &trap(cause, 0, 0)),
            Err(Error::VmCpuNotRunning)
        );

        table
            .resume(
                &mut hart,
                &mut frame,
                0,
                Replay::Explicit {
                    ret0: 0xaa,
                    ret1: 0xbb,
                },
            )
            .unwrap();
        let mut expected = guest_gprs();
        expected.set_reg(GprIndex::A0, 0xaa);
        expected.set_reg(GprIndex::A1, 0xbb);
        assert_eq!(frame.gprs, expected);
        assert_eq!(hart.read_csr(MachineCsr::Hgatp), guest_hgatp(VMID));
    }

    #[test]
    fn faults_and_interrupts_expose_nothing() {
        let table = VmCpuTable::new();
        let mut hart = FakeHart::new(0);
        let mut frame = running_vcpu(&table, &mut hart);
        let cause = Exception::LoadFault as u64;
        table.preserve(&mut hart, &mut frame, &trap(cause, 0x9000, 0)).unwrap();
        assert_eq!(frame.gprs, GeneralPurposeRegisters::default());
        table
            .resume(&mut hart, &mut frame, 0, Replay::Explicit { ret0: 1, ret1: 2 })
            .unwrap();
        assert_eq!(frame.gprs, guest_gprs());

        let timer = Trap::Interrupt(riscv_regs::Interrupt::SupervisorTimer).to_mcause();
        table.preserve(&mut hart, &mut frame, &trap(timer, 0, 0)).unwrap();
        assert_eq!(frame.gprs, GeneralPurposeRegisters::default());
    }

    #[test]
    fn mmio_load_replays_extended_value() {
        let table = VmCpuTable::new();
        let mut hart = FakeHart::new(0);
        let mut frame = running_vcpu(&table, &mut hart);
        table.with_vcpu(key(0), |r| r.set_mmio_next()).unwrap();

        // Transformed `lw a3, 0(a4)`.
        let cause = Exception::GuestLoadPageFault as u64;
        table.preserve(&mut hart, &mut frame, &trap(cause, 0, 0x2683)).unwrap();
        let mut expected = GeneralPurposeRegisters::default();
        expected.set_reg(GprIndex::A0, 0x2683);
        assert_eq!(frame.gprs, expected);

        table
            .resume(
                &mut hart,
                &mut frame,
                0,
                Replay::Explicit {
                    ret0: 0x1_8000_0000,
                    ret1: 0,
                },
            )
            .unwrap();
        assert_eq!(frame.gprs.reg(GprIndex::A3), 0xffff_ffff_8000_0000);
        assert_eq!(frame.gprs.reg(GprIndex::A4), guest_gprs().reg(GprIndex::A4));
        assert_eq!(table.with_vcpu(key(0), |r| r.pending_mmio()), Ok(None));

        // Without a request the next page fault exposes nothing.
        table.preserve(&mut hart, &mut frame, &trap(cause, 0, 0x2683)).unwrap();
        assert_eq!(frame.gprs, GeneralPurposeRegisters::default());
    }

    #[test]
    fn mmio_store_fetches_instruction() {
        let table = VmCpuTable::new();
        let mut hart = FakeHart::new(0);
        let mut frame = running_vcpu(&table, &mut hart);
        table.with_vcpu(key(0), |r| r.set_mmio_next()).unwrap();
        // `sd a5, 8(a6)`
        hart.add_guest_instruction(0x1_0000, 0x00f8_3423);

        let cause = Exception::GuestStorePageFault as u64;
        table.preserve(&mut hart, &mut frame, &trap(cause, 0, 0)).unwrap();
        assert_eq!(frame.gprs.reg(GprIndex::A0), 0x00f8_3423);
        assert_eq!(frame.gprs.reg(GprIndex::A1), guest_gprs().reg(GprIndex::A5));
        assert_eq!(frame.gprs.reg(GprIndex::A5), 0);
        let op = table.with_vcpu(key(0), |r| r.pending_mmio()).unwrap();
        assert_eq!(op.map(|o| o.register()), Some(GprIndex::A5));
    }

    #[test]
    fn undecodable_mmio_exposes_nothing() {
        let table = VmCpuTable::new();
        let mut hart = FakeHart::new(0);
        let mut frame = running_vcpu(&table, &mut hart);
        table.with_vcpu(key(0), |r| r.set_mmio_next()).unwrap();
        let cause = Exception::GuestLoadPageFault as u64;
        table.preserve(&mut hart, &mut frame, &trap(cause, 0, 0)).unwrap();
        assert_eq!(frame.gprs, GeneralPurposeRegisters::default());
        assert_eq!(table.with_vcpu(key(0), |r| r.pending_mmio()), Ok(None));
    }

    #[test]
    fn csr_exit_resumes_on_sret() {
        let table = VmCpuTable::new();
        let mut hart = FakeHart::new(0);
        let mut frame = running_vcpu(&table, &mut hart);
        // csrrw a0, hgatp, a1
        let cause = Exception::VirtualInstruction as u64;
        table
            .preserve(&mut hart, &mut frame, &trap(cause, 0x6805_9573, 0))
            .unwrap();
        let mut expected = GeneralPurposeRegisters::default();
        expected.set_reg(GprIndex::A1, guest_gprs().reg(GprIndex::A1));
        assert_eq!(frame.gprs, expected);

        // The hypervisor emulates the read into a0 and returns past the instruction.
        frame.gprs.set_reg(GprIndex::A0, 0x77);
        hart.write_csr(MachineCsr::Sepc, 0x1_0004);
        table.handle_sret(&mut hart, &mut frame).unwrap();
        let mut expected = guest_gprs();
        expected.set_reg(GprIndex::A0, 0x77);
        assert_eq!(frame.gprs, expected);
        assert_eq!(table.hart_state(0), Ok(HartVcpuState::GuestRunning(key(0))));
        assert_eq!(frame.mstatus & tvm_tsr(), 0);
    }

    #[test]
    fn sret_into_guest_trap_vector() {
        let table = VmCpuTable::new();
        let mut hart = FakeHart::new(0);
        let mut frame = running_vcpu(&table, &mut hart);
        let cause = Exception::VirtualInstruction as u64;
        table
            .preserve(&mut hart, &mut frame, &trap(cause, 0x6805_9573, 0))
            .unwrap();
        frame.gprs.set_reg(GprIndex::A0, 0x77);
        hart.write_csr(MachineCsr::Vstvec, 0x8020_0000);
        hart.write_csr(MachineCsr::Sepc, 0x8020_0000);
        table.handle_sret(&mut hart, &mut frame).unwrap();
        assert_eq!(frame.gprs, guest_gprs());
    }

    #[test]
    fn other_srets_only_clear_tsr() {
        let table = VmCpuTable::new();
        let mut hart = FakeHart::new(0);
        let mut frame = running_vcpu(&table, &mut hart);
        let cause = Exception::VirtualSupervisorEnvCall as u64;
        table.preserve(&mut hart, &mut frame, &trap(cause, 0, 0)).unwrap();
        let scrubbed = frame.gprs;
        hart.write_csr(MachineCsr::Sepc, 0x1_0004);
        table.handle_sret(&mut hart, &mut frame).unwrap();
        assert_eq!(frame.gprs, scrubbed);
        assert_eq!(frame.mstatus & mstatus::tsr::SET.value, 0);
        assert_eq!(frame.mstatus & mstatus::tvm::SET.value, mstatus::tvm::SET.value);
        assert_eq!(table.hart_state(0), Ok(HartVcpuState::Idle));
        // The vCPU can still be resumed explicitly.
        assert_eq!(
            table.with_vcpu(key(0), |r| r.status()),
            Ok(VmCpuStatus::Forwarding)
        );
        table
            .resume(&mut hart, &mut frame, 0, Replay::None)
            .unwrap();
    }

    #[test]
    #[should_panic(expected = "hart halted")]
    fn unknown_exit_cause_halts() {
        let table = VmCpuTable::new();
        let mut hart = FakeHart::new(0);
        hart.write_csr(MachineCsr::Hgatp, guest_hgatp(VMID));
        table.create(VMID, 0, guest_gprs(), guest_hgatp(VMID)).unwrap();
        table
            .with_vcpu(key(0), |r| r.trap.cause = Exception::Breakpoint as u64)
            .unwrap();
        let _ = table.resume(&mut hart, &mut TrapFrame::default(), 0, Replay::None);
    }
}
