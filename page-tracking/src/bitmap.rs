// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use riscv_pages::{Pfn, DRAM_BASE};

/// Errors related to classifying physical pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The bitmap has not been given its backing memory yet.
    NotInitialized,
    /// The range starts below DRAM or ends past the tracked window.
    OutOfRange,
}

/// Holds the result of page tracking operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Classification of a frame. The discriminant is the byte stored in the bitmap.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageClass {
    /// Owned by a confidential VM; may not be mapped by the hypervisor.
    Private = 0x00,
    /// Owned by a confidential VM and exposed to the hypervisor.
    Shared = 0x0f,
    /// Owned by the hypervisor.
    Public = 0xff,
}

impl PageClass {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => PageClass::Private,
            0x0f => PageClass::Shared,
            // Any other non-zero value counts as public.
            _ => PageClass::Public,
        }
    }
}

/// One byte per 4kB frame of DRAM, starting at `DRAM_BASE`.
pub struct PageBitmap {
    meta: Option<&'static mut [u8]>,
}

impl PageBitmap {
    /// Creates an empty bitmap. Every query fails with `NotInitialized` until `init`.
    pub const fn new() -> Self {
        Self { meta: None }
    }

    /// Takes `mem` as the backing store and marks every tracked frame public.
    pub fn init(&mut self, mem: &'static mut [u8]) {
        mem.fill(PageClass::Public as u8);
        self.meta = Some(mem);
    }

    /// Returns true once `init` has been called.
    pub fn is_initialized(&self) -> bool {
        self.meta.is_some()
    }

    /// Returns the first tracked frame and the number of frames tracked.
    pub fn tracked_pfns(&self) -> Result<(Pfn, u64)> {
        let meta = self.meta.as_ref().ok_or(Error::NotInitialized)?;
        Ok((Pfn::from_addr(DRAM_BASE), meta.len() as u64))
    }

    // Converts a frame range to an index range into the bitmap.
    fn index_range(len: usize, start: Pfn, num: u64) -> Result<core::ops::Range<usize>> {
        let first = start
            .bits()
            .checked_sub(Pfn::from_addr(DRAM_BASE).bits())
            .ok_or(Error::OutOfRange)?;
        let end = first.checked_add(num).ok_or(Error::OutOfRange)?;
        if end > len as u64 {
            return Err(Error::OutOfRange);
        }
        Ok(first as usize..end as usize)
    }

    fn bytes(&self, start: Pfn, num: u64) -> Result<&[u8]> {
        let meta = self.meta.as_deref().ok_or(Error::NotInitialized)?;
        let range = Self::index_range(meta.len(), start, num)?;
        Ok(&meta[range])
    }

    fn bytes_mut(&mut self, start: Pfn, num: u64) -> Result<&mut [u8]> {
        let meta = self.meta.as_deref_mut().ok_or(Error::NotInitialized)?;
        let range = Self::index_range(meta.len(), start, num)?;
        Ok(&mut meta[range])
    }

    /// Sets the class of `num` frames starting at `start`. Nothing is written unless the whole
    /// range is tracked.
    pub fn classify_range(&mut self, start: Pfn, num: u64, class: PageClass) -> Result<()> {
        self.bytes_mut(start, num)?.fill(class as u8);
        Ok(())
    }

    pub fn set_private_range(&mut self, start: Pfn, num: u64) -> Result<()> {
        self.classify_range(start, num, PageClass::Private)
    }

    pub fn set_public_range(&mut self, start: Pfn, num: u64) -> Result<()> {
        self.classify_range(start, num, PageClass::Public)
    }

    pub fn set_shared_range(&mut self, start: Pfn, num: u64) -> Result<()> {
        self.classify_range(start, num, PageClass::Shared)
    }

    /// Returns the class of a single frame.
    pub fn class(&self, pfn: Pfn) -> Result<PageClass> {
        Ok(PageClass::from_byte(self.bytes(pfn, 1)?[0]))
    }

    /// Returns true if any frame in the range is private.
    pub fn contains_private(&self, start: Pfn, num: u64) -> Result<bool> {
        Ok(self
            .bytes(start, num)?
            .iter()
            .any(|&b| b == PageClass::Private as u8))
    }

    /// Returns true if no frame in the range is private.
    pub fn is_all_public_or_shared(&self, start: Pfn, num: u64) -> Result<bool> {
        Ok(!self.contains_private(start, num)?)
    }
}

impl Default for PageBitmap {
    fn default() -> Self {
        Self::new()
    }
}
