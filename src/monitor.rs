// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! The security monitor: configuration, the shared page state and the operations behind the SM
//! calls.

use arrayvec::ArrayVec;
use m_mode_utils::{println, sm_println};
use page_tracking::PageTrackingError;
use riscv_page_tables::{
    translate_gpa, GuestStageMode, HptArea, HptError, HptGuard, HptLayout, Pte, PTE_SIZE,
};
#[cfg(feature = "reverse-map")]
use riscv_page_tables::{GuardState, ReverseMap};
use riscv_pages::{PageSize, Pfn, ENTRIES_PER_PAGE};
use riscv_regs::{
    hgatp, HgatpHelpers, LocalRegisterCopy, MachineCsr, PmpAccess, PmpConfig, PmpError,
    TrapFrame,
};
use sbi::{Error as SbiError, SetPteOp};
use sync::{Mutex, MutexGuard};

use crate::hart::{HartCsrs, Platform};
use crate::hart_sync::{self, HartSync};
use crate::trap::return_to_guest;
use crate::vm_cpu::{self, Replay, VcpuKey, VmCpuTable};
use crate::MAX_HARTS;

/// Largest batch `set_pte` copies or clears: one page of entries.
const MAX_BATCH_ENTRIES: usize = ENTRIES_PER_PAGE as usize;
/// Largest bounce buffer a guest can register, in pages.
const MAX_BOUNCE_PAGES: usize = ENTRIES_PER_PAGE as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The bitmap, HPT area or reverse map was already handed to the monitor.
    AlreadyInitialized,
    /// A size, alignment or region placement is wrong.
    InvalidParam,
    /// The caller may not touch the memory it named.
    Denied,
    /// The monitor was built without the requested feature.
    NotSupported,
    /// The request is larger than the monitor handles in one call.
    OutOfCapacity,
    /// The address isn't memory the monitor can reach.
    OutOfRange,
    /// The calling hart isn't running a tracked vCPU.
    NotRunning,
    PageTable(HptError),
    VmCpu(vm_cpu::Error),
    HartSync(hart_sync::Error),
    Pmp(PmpError),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<HptError> for Error {
    fn from(e: HptError) -> Self {
        Error::PageTable(e)
    }
}

impl From<vm_cpu::Error> for Error {
    fn from(e: vm_cpu::Error) -> Self {
        Error::VmCpu(e)
    }
}

impl From<hart_sync::Error> for Error {
    fn from(e: hart_sync::Error) -> Self {
        Error::HartSync(e)
    }
}

impl From<PmpError> for Error {
    fn from(e: PmpError) -> Self {
        Error::Pmp(e)
    }
}

// Both error types live in other crates, so this can't be a `From` impl.
fn page_table_sbi_error(error: HptError) -> SbiError {
    use HptError::*;
    match error {
        NotInitialized | EnableNotStarted => SbiError::Failed,
        AlreadyInitialized | AlreadyEnabled => SbiError::AlreadyAvailable,
        InvalidLayout | InvalidPageCount { .. } => SbiError::InvalidParam,
        InvalidAddress(_) | UnmappedGuestAddress(_) => SbiError::InvalidAddress,
        InvalidEntry(_) | EnableInProgress => SbiError::Denied,
        OutOfNodes | ReverseMapTooSmall => SbiError::InsufficientBufferCapacity,
        UnsupportedMode(_) => SbiError::NotSupported,
        Bitmap(PageTrackingError::NotInitialized) => SbiError::Failed,
        Bitmap(PageTrackingError::OutOfRange) => SbiError::InvalidAddress,
    }
}

impl From<vm_cpu::Error> for SbiError {
    fn from(error: vm_cpu::Error) -> SbiError {
        use vm_cpu::Error::*;
        match error {
            BadCpuId | VmCpuNotFound => SbiError::InvalidParam,
            VmCpuExists => SbiError::AlreadyAvailable,
            VmCpuRunning => SbiError::AlreadyStarted,
            VmCpuNotRunning => SbiError::AlreadyStopped,
            BadHartId(_) => SbiError::Failed,
        }
    }
}

impl From<Error> for SbiError {
    fn from(error: Error) -> SbiError {
        use Error::*;
        match error {
            AlreadyInitialized => SbiError::AlreadyAvailable,
            InvalidParam | Pmp(_) => SbiError::InvalidParam,
            Denied => SbiError::Denied,
            NotSupported => SbiError::NotSupported,
            OutOfCapacity => SbiError::InsufficientBufferCapacity,
            OutOfRange => SbiError::InvalidAddress,
            NotRunning => SbiError::AlreadyStopped,
            PageTable(e) => page_table_sbi_error(e),
            VmCpu(e) => e.into(),
            HartSync(_) => SbiError::Failed,
        }
    }
}

/// Boot-time settings of the monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Number of harts taking part in protection changes.
    pub num_harts: usize,
    /// PMP entry guarding the page classification bitmap.
    pub bitmap_pmp_slot: usize,
    /// PMP entry making the HPT area read-only.
    pub hpt_pmp_slot: usize,
    /// PMP entry guarding the reverse map.
    pub rmap_pmp_slot: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            num_harts: MAX_HARTS,
            bitmap_pmp_slot: 1,
            hpt_pmp_slot: 2,
            rmap_pmp_slot: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RegionKind {
    Bitmap,
    Hpt,
    #[cfg_attr(not(feature = "reverse-map"), allow(dead_code))]
    ReverseMap,
}

// Memory taken from the hypervisor and covered by a PMP entry.
#[derive(Clone, Copy, Debug)]
struct ProtectedRegion {
    kind: RegionKind,
    base: u64,
    size: u64,
}

impl ProtectedRegion {
    fn overlaps(&self, base: u64, size: u64) -> bool {
        base < self.base.saturating_add(self.size) && self.base < base.saturating_add(size)
    }
}

/// Everything guarded by the page-state lock.
pub(crate) struct PageState {
    pub(crate) guard: HptGuard,
    regions: ArrayVec<ProtectedRegion, 3>,
}

impl PageState {
    fn has_region(&self, kind: RegionKind) -> bool {
        self.regions.iter().any(|r| r.kind == kind)
    }

    fn overlaps_region(&self, base: u64, size: u64) -> bool {
        self.regions.iter().any(|r| r.overlaps(base, size))
    }

    fn release(&mut self, kind: RegionKind) {
        self.regions.retain(|r| r.kind != kind);
    }
}

/// The state shared by every hart running the monitor.
pub struct SecurityMonitor<P: Platform> {
    config: MonitorConfig,
    platform: P,
    pages: Mutex<PageState>,
    sync: HartSync,
    vcpus: VmCpuTable,
}

impl<P: Platform> SecurityMonitor<P> {
    /// Creates a monitor for `config.num_harts` harts on `platform`.
    pub fn new(config: MonitorConfig, platform: P) -> Result<Self> {
        let slots = [
            config.bitmap_pmp_slot,
            config.hpt_pmp_slot,
            config.rmap_pmp_slot,
        ];
        if slots[0] == slots[1] || slots[0] == slots[2] || slots[1] == slots[2] {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            config,
            platform,
            pages: Mutex::new(PageState {
                guard: HptGuard::new(),
                regions: ArrayVec::new(),
            }),
            sync: HartSync::new(config.num_harts)?,
            vcpus: VmCpuTable::new(),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub(crate) fn vcpus(&self) -> &VmCpuTable {
        &self.vcpus
    }

    pub(crate) fn lock_pages(&self) -> MutexGuard<'_, PageState> {
        self.pages.lock()
    }

    /// Applies the protection changes other harts posted for `hart`. The firmware calls this from
    /// its machine software interrupt handler.
    pub fn process_ipi<H: HartCsrs>(&self, hart: &mut H, frame: &mut TrapFrame) -> Result<usize> {
        Ok(self.sync.process_ipi(hart, &self.platform, frame)?)
    }

    // Returns the monitor's view of `[base, base + size)`.
    fn map_region(&self, base: u64, size: u64) -> Result<*mut u8> {
        self.platform.phys_ptr(base, size).ok_or(Error::OutOfRange)
    }

    // Reserves `region` under the page-state lock so no concurrent init claims overlapping memory.
    fn reserve(&self, state: &mut PageState, region: ProtectedRegion) -> Result<()> {
        if state.overlaps_region(region.base, region.size) {
            return Err(Error::InvalidParam);
        }
        state.regions.push(region);
        Ok(())
    }

    fn protect<H: HartCsrs>(
        &self,
        pmp: PmpConfig,
        hart: &mut H,
        frame: &mut TrapFrame,
    ) -> Result<()> {
        Ok(self.sync.set_pmp_and_sync(pmp, hart, &self.platform, frame)?)
    }

    /// Takes the page classification bitmap and the HPT area from the hypervisor and protects
    /// them on every hart.
    #[allow(clippy::too_many_arguments)]
    pub fn bitmap_and_hpt_init<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        bitmap_base: u64,
        bitmap_size: u64,
        hpt_base: u64,
        hpt_size: u64,
        pmd_base: u64,
        pte_base: u64,
    ) -> Result<()> {
        let layout = HptLayout::new(hpt_base, hpt_size, pmd_base, pte_base)?;
        let bitmap_pmp = PmpConfig::napot(
            self.config.bitmap_pmp_slot,
            PmpAccess::NoAccess,
            bitmap_base,
            bitmap_size,
        )?;
        let hpt_pmp = PmpConfig::napot(
            self.config.hpt_pmp_slot,
            PmpAccess::ReadOnly,
            hpt_base,
            hpt_size,
        )?;
        if layout.overlaps(bitmap_base, bitmap_size) {
            return Err(Error::InvalidParam);
        }
        let bitmap_ptr = self.map_region(bitmap_base, bitmap_size)?;
        let hpt_ptr = self.map_region(hpt_base, hpt_size)?;

        {
            let mut state = self.lock_pages();
            if state.guard.is_initialized()
                || state.has_region(RegionKind::Bitmap)
                || state.has_region(RegionKind::Hpt)
            {
                return Err(Error::AlreadyInitialized);
            }
            self.reserve(
                &mut state,
                ProtectedRegion {
                    kind: RegionKind::Bitmap,
                    base: bitmap_base,
                    size: bitmap_size,
                },
            )?;
            if let Err(e) = self.reserve(
                &mut state,
                ProtectedRegion {
                    kind: RegionKind::Hpt,
                    base: hpt_base,
                    size: hpt_size,
                },
            ) {
                state.release(RegionKind::Bitmap);
                return Err(e);
            }
        }

        let protected = self
            .protect(bitmap_pmp, hart, frame)
            .and_then(|_| self.protect(hpt_pmp, hart, frame));
        if let Err(e) = protected {
            let mut state = self.lock_pages();
            state.release(RegionKind::Bitmap);
            state.release(RegionKind::Hpt);
            return Err(e);
        }

        // Safety: both regions were checked accessible by the platform, are disjoint, and are
        // now reserved for the monitor and protected from S mode on every hart. The HPT area is
        // page aligned, so it is aligned for `u64`.
        let (bitmap_mem, hpt_entries) = unsafe {
            (
                core::slice::from_raw_parts_mut(bitmap_ptr, bitmap_size as usize),
                core::slice::from_raw_parts_mut(
                    hpt_ptr as *mut u64,
                    (hpt_size / PTE_SIZE) as usize,
                ),
            )
        };
        let mut state = self.lock_pages();
        let initialized = HptArea::new(layout, hpt_entries)
            .and_then(|area| state.guard.init(bitmap_mem, area));
        if let Err(e) = initialized {
            state.release(RegionKind::Bitmap);
            state.release(RegionKind::Hpt);
            return Err(e.into());
        }
        sm_println!(
            hart.hart_id(),
            "bitmap at 0x{:x} ({} frames), HPT area 0x{:x}-0x{:x}",
            bitmap_base,
            bitmap_size,
            hpt_base,
            hpt_base + hpt_size
        );
        Ok(())
    }

    /// Takes `[base, base + size)` from the hypervisor as reverse map memory. Only possible
    /// between `bitmap_and_hpt_init` and `monitor_init`.
    #[cfg(feature = "reverse-map")]
    pub fn reverse_map_init<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        base: u64,
        size: u64,
    ) -> Result<()> {
        let pmp = PmpConfig::napot(self.config.rmap_pmp_slot, PmpAccess::NoAccess, base, size)?;
        let ptr = self.map_region(base, size)?;
        let (window_start, frames) = {
            let mut state = self.lock_pages();
            match state.guard.state() {
                GuardState::Disabled => (),
                GuardState::Arming => return Err(HptError::EnableInProgress.into()),
                GuardState::Enabled => return Err(HptError::AlreadyEnabled.into()),
            }
            if !state.guard.is_initialized() {
                return Err(HptError::NotInitialized.into());
            }
            if state.guard.has_reverse_map() || state.has_region(RegionKind::ReverseMap) {
                return Err(Error::AlreadyInitialized);
            }
            let window = state.guard.tracked_pfns()?;
            self.reserve(
                &mut state,
                ProtectedRegion {
                    kind: RegionKind::ReverseMap,
                    base,
                    size,
                },
            )?;
            window
        };

        if let Err(e) = self.protect(pmp, hart, frame) {
            self.lock_pages().release(RegionKind::ReverseMap);
            return Err(e);
        }

        // Safety: the region is accessible, disjoint from the other monitor regions, reserved
        // above and protected from S mode on every hart.
        let mem = unsafe { core::slice::from_raw_parts_mut(ptr, size as usize) };
        let mut state = self.lock_pages();
        let installed = ReverseMap::new(mem, window_start, frames)
            .and_then(|map| state.guard.install_reverse_map(map));
        if let Err(e) = installed {
            state.release(RegionKind::ReverseMap);
            return Err(e.into());
        }
        sm_println!(
            hart.hart_id(),
            "reverse map at 0x{:x}-0x{:x}",
            base,
            base + size
        );
        Ok(())
    }

    #[cfg(not(feature = "reverse-map"))]
    pub fn reverse_map_init<H: HartCsrs>(
        &self,
        _hart: &mut H,
        _frame: &mut TrapFrame,
        _base: u64,
        _size: u64,
    ) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Checks the existing hypervisor page tables, arms TVM on every hart and turns on
    /// validation of every entry write. Returns the `mstatus` the caller returns with.
    pub fn monitor_init<H: HartCsrs>(&self, hart: &mut H, frame: &mut TrapFrame) -> Result<u64> {
        self.lock_pages().guard.begin_enable()?;
        // Other harts take the page-state lock from their own traps; TVM is armed without it.
        if let Err(e) = self.sync.set_tvm_and_sync(hart, &self.platform, frame) {
            self.lock_pages().guard.abort_enable();
            return Err(e.into());
        }
        let mut state = self.lock_pages();
        state.guard.finish_enable()?;
        sm_println!(
            hart.hart_id(),
            "HPT validation enabled ({})",
            if state.guard.has_reverse_map() {
                "reverse map"
            } else {
                "linear scan"
            }
        );
        Ok(frame.mstatus)
    }

    /// Writes entries of the HPT area on behalf of the hypervisor.
    ///
    /// `SetOne` writes `value` at `addr`, with `size` the number of pages the entry maps. `Clear`
    /// and `Memcpy` fill the `size` bytes at `addr` with zeroes or with the entries at physical
    /// address `value`. Either every entry is written or none is.
    pub fn set_pte(&self, op: SetPteOp, addr: u64, value: u64, size: u64) -> Result<()> {
        let mut state = self.lock_pages();
        if op == SetPteOp::SetOne {
            state
                .guard
                .validate_and_set(addr, Pte::from_bits(value), size)?;
            return Ok(());
        }

        if size == 0 || size % PTE_SIZE != 0 || addr % PTE_SIZE != 0 {
            return Err(Error::InvalidParam);
        }
        if size > PageSize::Size4k as u64 {
            return Err(Error::OutOfCapacity);
        }
        let count = (size / PTE_SIZE) as usize;
        let mut entries = ArrayVec::<Pte, MAX_BATCH_ENTRIES>::new();
        match op {
            SetPteOp::Clear => {
                entries.extend((0..count).map(|_| Pte::default()));
            }
            _ => {
                self.check_copy_source(&state, value, size)?;
                for i in 0..count as u64 {
                    let bits = self
                        .platform
                        .read_phys_u64(value + i * PTE_SIZE)
                        .ok_or(Error::OutOfRange)?;
                    entries.push(Pte::from_bits(bits));
                }
            }
        }

        let guard = &mut state.guard;
        for (i, pte) in entries.iter().enumerate() {
            let entry_addr = addr + i as u64 * PTE_SIZE;
            guard.validate(entry_addr, *pte, guard.page_span(entry_addr)?)?;
        }
        let mut written = ArrayVec::<(u64, Pte), MAX_BATCH_ENTRIES>::new();
        for (i, pte) in entries.iter().enumerate() {
            let entry_addr = addr + i as u64 * PTE_SIZE;
            let span = guard.page_span(entry_addr)?;
            match guard.validate_and_set(entry_addr, *pte, span) {
                Ok(old) => written.push((entry_addr, old)),
                Err(e) => {
                    for (entry_addr, old) in written.iter().rev() {
                        if guard.restore_entry(*entry_addr, *old).is_err() {
                            println!("failed to restore HPT entry at 0x{:x}", entry_addr);
                        }
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    // The source of a copy must be readable by the hypervisor itself.
    fn check_copy_source(&self, state: &PageState, src: u64, size: u64) -> Result<()> {
        if src % PTE_SIZE != 0 {
            return Err(Error::InvalidParam);
        }
        let end = src.checked_add(size).ok_or(Error::OutOfRange)?;
        let first = Pfn::from_addr(src);
        let frames = Pfn::from_addr(end - 1).bits() - first.bits() + 1;
        if state.guard.maps_private(first, frames)? {
            return Err(Error::Denied);
        }
        let hidden = state
            .regions
            .iter()
            .filter(|r| r.kind != RegionKind::Hpt)
            .any(|r| r.overlaps(src, size));
        if hidden {
            return Err(Error::Denied);
        }
        Ok(())
    }

    // Converts a page-aligned physical range to frames.
    fn page_range(paddr: u64, size: u64) -> Result<(Pfn, u64)> {
        let page = PageSize::Size4k;
        if size == 0 || !page.is_aligned(paddr) || !page.is_aligned(size) {
            return Err(Error::InvalidParam);
        }
        Ok((Pfn::from_addr(paddr), size / page as u64))
    }

    /// Unmaps `[paddr, paddr + size)` from the hypervisor and marks it private.
    pub fn set_private(&self, paddr: u64, size: u64) -> Result<()> {
        let (start, num) = Self::page_range(paddr, size)?;
        Ok(self.lock_pages().guard.set_private(start, num)?)
    }

    /// Marks `[paddr, paddr + size)` shared with the hypervisor.
    pub fn set_shared(&self, paddr: u64, size: u64) -> Result<()> {
        let (start, num) = Self::page_range(paddr, size)?;
        Ok(self.lock_pages().guard.set_shared(start, num)?)
    }

    /// Creates vCPU `cpu_id` of the VM loaded in `hgatp`, starting from the registers in `frame`.
    pub fn create_cpu<H: HartCsrs>(&self, hart: &H, frame: &TrapFrame, cpu_id: u64) -> Result<()> {
        let full_hgatp = hart.read_csr(MachineCsr::Hgatp);
        let vm_id = LocalRegisterCopy::<u64, hgatp::Register>::new(full_hgatp).vmid();
        let cpu = usize::try_from(cpu_id).map_err(|_| vm_cpu::Error::BadCpuId)?;
        if let Some(old_vm) = self.vcpus.create(vm_id, cpu, frame.gprs, full_hgatp)? {
            sm_println!(
                hart.hart_id(),
                "vCPU {} of VM {} replaces the record of VM {}",
                cpu_id,
                vm_id,
                old_vm
            );
        }
        Ok(())
    }

    /// Requests MMIO decoding of the next guest page fault of vCPU `cpu_id`.
    pub fn prepare_mmio<H: HartCsrs>(&self, hart: &H, cpu_id: u64) -> Result<()> {
        let key = VcpuKey::from_live_hgatp(hart, cpu_id);
        Ok(self.vcpus.with_vcpu(key, |record| record.set_mmio_next())?)
    }

    /// Restores vCPU `cpu_id` into `frame`, replaying `ret0`/`ret1` for its last exit, and
    /// enters it at the hypervisor's `sepc` as its `sret` would.
    pub fn resume_cpu<H: HartCsrs>(
        &self,
        hart: &mut H,
        frame: &mut TrapFrame,
        cpu_id: u64,
        ret0: u64,
        ret1: u64,
    ) -> Result<()> {
        self.vcpus
            .resume(hart, frame, cpu_id, Replay::Explicit { ret0, ret1 })?;
        return_to_guest(hart, frame);
        Ok(())
    }

    /// Shares the guest pages `[gpa, gpa + size)` of the vCPU running on `hart` with the
    /// hypervisor.
    pub fn set_bounce_buffer<H: HartCsrs>(&self, hart: &H, gpa: u64, size: u64) -> Result<()> {
        let key = self
            .vcpus
            .running_vcpu(hart.hart_id())
            .ok_or(Error::NotRunning)?;
        let page = PageSize::Size4k;
        if size == 0 || !page.is_aligned(gpa) || !page.is_aligned(size) {
            return Err(Error::InvalidParam);
        }
        let pages = size / page as u64;
        if pages > MAX_BOUNCE_PAGES as u64 {
            return Err(Error::OutOfCapacity);
        }
        gpa.checked_add(size).ok_or(Error::OutOfRange)?;

        let hgatp = LocalRegisterCopy::<u64, hgatp::Register>::new(
            self.vcpus.with_vcpu(key, |record| record.hgatp())?,
        );
        let mode = GuestStageMode::from_hgatp_mode(hgatp.read(hgatp::mode))?;
        let root = Pfn::new(hgatp.read(hgatp::ppn));
        let mut frames = ArrayVec::<Pfn, MAX_BOUNCE_PAGES>::new();
        for i in 0..pages {
            let hpa = translate_gpa(mode, root, gpa + i * page as u64, |addr| {
                self.platform.read_phys_u64(addr)
            })?;
            frames.push(Pfn::from_addr(hpa));
        }

        {
            let mut state = self.lock_pages();
            // Nothing changes unless every frame is tracked.
            for pfn in frames.iter() {
                state.guard.bitmap().class(*pfn).map_err(HptError::from)?;
            }
            for pfn in frames.iter() {
                state.guard.set_shared(*pfn, 1)?;
            }
        }
        self.vcpus
            .with_vcpu(key, |record| record.set_bounce_buffer(gpa, size))?;
        Ok(())
    }
}
