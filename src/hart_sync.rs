// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Propagation of protection changes to every hart.
//!
//! The initiating hart applies a change locally, drops a copy into a mailbox slot of every other
//! hart, raises the matching pending flags and sends an IPI. It then spins until every target has
//! cleared its flag. Each (target, source) pair has its own slot, so two harts can propagate at
//! the same time; both keep draining their own mailboxes while they wait.

use core::sync::atomic::{AtomicBool, Ordering};

use riscv_regs::{fence, mstatus, MachineCsr, PmpConfig, TrapFrame};
use sync::Mutex;

use crate::hart::{HartCsrs, Platform};
use crate::MAX_HARTS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The mailboxes can't hold the requested number of harts.
    OutOfScratchMemory,
    /// The hart id is outside the harts being synchronized.
    InvalidHart(usize),
}

pub type Result<T> = core::result::Result<T, Error>;

/// A change that has to be made on every hart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtectionChange {
    Pmp(PmpConfig),
    EnableTvm,
}

impl ProtectionChange {
    // Applies the change on `hart`. `frame` is the state the hart returns to, so bits of mstatus
    // that the trap exit restores must be set there too.
    fn apply<H: HartCsrs, P: Platform>(&self, hart: &mut H, platform: &P, frame: &mut TrapFrame) {
        match self {
            ProtectionChange::Pmp(pmp) => platform.pmp_set(hart.hart_id(), pmp),
            ProtectionChange::EnableTvm => {
                let tvm = mstatus::tvm::SET.value;
                hart.set_csr_bits(MachineCsr::Mstatus, tvm);
                frame.mstatus |= tvm;
            }
        }
    }
}

type Mailbox = Mutex<Option<ProtectionChange>>;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_MAILBOX: Mailbox = Mutex::new(None);
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_MAILBOX_ROW: [Mailbox; MAX_HARTS] = [EMPTY_MAILBOX; MAX_HARTS];
#[allow(clippy::declare_interior_mutable_const)]
const NOT_PENDING: AtomicBool = AtomicBool::new(false);
#[allow(clippy::declare_interior_mutable_const)]
const NOT_PENDING_ROW: [AtomicBool; MAX_HARTS] = [NOT_PENDING; MAX_HARTS];

/// Per-hart mailboxes, indexed by `[target][source]`.
pub struct HartSync {
    num_harts: usize,
    mailboxes: [[Mailbox; MAX_HARTS]; MAX_HARTS],
    pending: [[AtomicBool; MAX_HARTS]; MAX_HARTS],
}

impl HartSync {
    /// Creates mailboxes for harts `0..num_harts`.
    pub fn new(num_harts: usize) -> Result<Self> {
        if num_harts == 0 || num_harts > MAX_HARTS {
            return Err(Error::OutOfScratchMemory);
        }
        Ok(Self {
            num_harts,
            mailboxes: [EMPTY_MAILBOX_ROW; MAX_HARTS],
            pending: [NOT_PENDING_ROW; MAX_HARTS],
        })
    }

    pub fn num_harts(&self) -> usize {
        self.num_harts
    }

    fn check_hart(&self, hart_id: usize) -> Result<()> {
        if hart_id >= self.num_harts {
            return Err(Error::InvalidHart(hart_id));
        }
        Ok(())
    }

    /// Applies every change other harts have posted for `hart`. Called from the IPI handler and
    /// while waiting for our own changes to land. Returns the number of changes applied.
    pub fn process_ipi<H: HartCsrs, P: Platform>(
        &self,
        hart: &mut H,
        platform: &P,
        frame: &mut TrapFrame,
    ) -> Result<usize> {
        let me = hart.hart_id();
        self.check_hart(me)?;
        let mut applied = 0;
        for source in 0..self.num_harts {
            if !self.pending[me][source].load(Ordering::Acquire) {
                continue;
            }
            let change = self.mailboxes[me][source].lock().take();
            if let Some(change) = change {
                change.apply(hart, platform, frame);
                applied += 1;
            }
            self.pending[me][source].store(false, Ordering::Release);
        }
        Ok(applied)
    }

    /// Applies `change` on this hart and on every other hart, returning once all have applied it.
    pub fn propagate<H: HartCsrs, P: Platform>(
        &self,
        change: ProtectionChange,
        hart: &mut H,
        platform: &P,
        frame: &mut TrapFrame,
    ) -> Result<()> {
        let me = hart.hart_id();
        self.check_hart(me)?;
        change.apply(hart, platform, frame);

        let mut targets = 0u64;
        for target in (0..self.num_harts).filter(|t| *t != me) {
            *self.mailboxes[target][me].lock() = Some(change);
            self.pending[target][me].store(true, Ordering::Release);
            targets |= 1 << target;
        }
        if targets == 0 {
            return Ok(());
        }
        platform.send_ipi(targets);

        while (0..self.num_harts)
            .filter(|t| targets & (1 << t) != 0)
            .any(|t| self.pending[t][me].load(Ordering::Acquire))
        {
            // Another hart may be waiting on us.
            self.process_ipi(hart, platform, frame)?;
            fence::pause();
        }
        Ok(())
    }

    /// Programs `pmp` on every hart.
    pub fn set_pmp_and_sync<H: HartCsrs, P: Platform>(
        &self,
        pmp: PmpConfig,
        hart: &mut H,
        platform: &P,
        frame: &mut TrapFrame,
    ) -> Result<()> {
        self.propagate(ProtectionChange::Pmp(pmp), hart, platform, frame)
    }

    /// Sets `mstatus.TVM` on every hart.
    pub fn set_tvm_and_sync<H: HartCsrs, P: Platform>(
        &self,
        hart: &mut H,
        platform: &P,
        frame: &mut TrapFrame,
    ) -> Result<()> {
        self.propagate(ProtectionChange::EnableTvm, hart, platform, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::*;
    use riscv_regs::PmpAccess;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    fn pmp(index: usize) -> PmpConfig {
        PmpConfig::napot(index, PmpAccess::NoAccess, 0x8020_0000, 0x1000).unwrap()
    }

    // Keeps taking IPIs on `hart` until `done` is set.
    fn service_ipis(sync: &HartSync, platform: &FakePlatform, hart: usize, done: &AtomicBool) {
        let mut fake = FakeHart::new(hart);
        let mut frame = TrapFrame::default();
        while !done.load(Ordering::Acquire) {
            sync.process_ipi(&mut fake, platform, &mut frame).unwrap();
            thread::yield_now();
        }
    }

    #[test]
    fn mailbox_limits() {
        assert_eq!(HartSync::new(0).err(), Some(Error::OutOfScratchMemory));
        assert_eq!(
            HartSync::new(MAX_HARTS + 1).err(),
            Some(Error::OutOfScratchMemory)
        );
        let sync = HartSync::new(2).unwrap();
        let platform = FakePlatform::new();
        let mut hart = FakeHart::new(2);
        assert_eq!(
            sync.set_tvm_and_sync(&mut hart, &platform, &mut TrapFrame::default()),
            Err(Error::InvalidHart(2))
        );
    }

    #[test]
    fn single_hart_applies_locally() {
        let sync = HartSync::new(1).unwrap();
        let platform = FakePlatform::new();
        let mut hart = FakeHart::new(0);
        let mut frame = TrapFrame::default();
        sync.set_tvm_and_sync(&mut hart, &platform, &mut frame)
            .unwrap();
        let tvm = mstatus::tvm::SET.value;
        assert_eq!(frame.mstatus & tvm, tvm);
        assert_eq!(hart.read_csr(MachineCsr::Mstatus) & tvm, tvm);
        assert!(platform.ipis().is_empty());
    }

    #[test]
    fn pmp_reaches_every_hart() {
        let sync = HartSync::new(3).unwrap();
        let platform = FakePlatform::new();
        let done = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| service_ipis(&sync, &platform, 1, &done));
            s.spawn(|| service_ipis(&sync, &platform, 2, &done));
            let mut hart = FakeHart::new(0);
            let mut frame = TrapFrame::default();
            sync.set_pmp_and_sync(pmp(4), &mut hart, &platform, &mut frame)
                .unwrap();
            done.store(true, Ordering::Release);
        });
        let mut harts: std::vec::Vec<usize> = platform
            .pmp_writes()
            .iter()
            .filter(|(_, cfg)| *cfg == pmp(4))
            .map(|(hart, _)| *hart)
            .collect();
        harts.sort();
        assert_eq!(harts, [0, 1, 2]);
        assert_eq!(platform.ipis(), [0b110]);
    }

    #[test]
    fn concurrent_initiators_do_not_deadlock() {
        let sync = HartSync::new(2).unwrap();
        let platform = FakePlatform::new();
        let finished = AtomicUsize::new(0);
        thread::scope(|s| {
            for hart_id in 0..2 {
                let sync = &sync;
                let platform = &platform;
                let finished = &finished;
                s.spawn(move || {
                    let mut hart = FakeHart::new(hart_id);
                    let mut frame = TrapFrame::default();
                    sync.set_pmp_and_sync(pmp(hart_id), &mut hart, platform, &mut frame)
                        .unwrap();
                    sync.set_tvm_and_sync(&mut hart, platform, &mut frame)
                        .unwrap();
                    let tvm = mstatus::tvm::SET.value;
                    assert_eq!(frame.mstatus & tvm, tvm);
                    // Keep answering the other hart until it is done as well.
                    finished.fetch_add(1, Ordering::AcqRel);
                    while finished.load(Ordering::Acquire) < 2 {
                        sync.process_ipi(&mut hart, platform, &mut frame).unwrap();
                        thread::yield_now();
                    }
                });
            }
        });
        // Each hart programmed both entries: its own and the one it received.
        let writes = platform.pmp_writes();
        for hart_id in 0..2 {
            for index in 0..2 {
                assert!(writes.contains(&(hart_id, pmp(index))));
            }
        }
    }
}
