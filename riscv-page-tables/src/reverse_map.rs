// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

use core::mem::size_of;
use core::ops::Range;

use riscv_pages::Pfn;
use static_assertions::const_assert_eq;

use crate::hpt::{Error, HptArea, Result};
use crate::pte::Pte;
use crate::tracker::MappingTracker;

const NIL: u32 = u32::MAX;

// A single (frame, PTE address) link. Nodes live in monitor-owned memory, so they are referenced
// by index rather than by pointer.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct RmapNode {
    pte_addr: u64,
    next: u32,
    _pad: u32,
}

const_assert_eq!(size_of::<RmapNode>(), 16);

/// Maps every tracked frame to the HPT entries that map it.
///
/// The backing memory is split into one list head per frame of the bitmap window followed by a
/// fixed pool of nodes. Free nodes are threaded on their own list.
pub struct ReverseMap {
    window_start: Pfn,
    heads: &'static mut [u32],
    nodes: &'static mut [RmapNode],
    free_head: u32,
    free_count: usize,
}

impl ReverseMap {
    /// Carves list heads for the `frames` frames starting at `window_start` out of `mem` and uses
    /// the rest as the node pool.
    pub fn new(mem: &'static mut [u8], window_start: Pfn, frames: u64) -> Result<Self> {
        let frames = usize::try_from(frames).map_err(|_| Error::ReverseMapTooSmall)?;
        let head_bytes = frames
            .checked_mul(size_of::<u32>())
            .ok_or(Error::ReverseMapTooSmall)?;
        let node_offset = head_bytes
            .checked_next_multiple_of(size_of::<RmapNode>())
            .ok_or(Error::ReverseMapTooSmall)?;
        if mem.len() < node_offset + size_of::<RmapNode>() {
            return Err(Error::ReverseMapTooSmall);
        }
        let (head_mem, node_mem) = mem.split_at_mut(node_offset);
        // Safety: `u32` and `RmapNode` are plain integers, any bit pattern is a valid value, and
        // `align_to_mut` only hands out the correctly aligned middle part.
        let (head_prefix, heads, _) = unsafe { head_mem.align_to_mut::<u32>() };
        let (node_prefix, nodes, _) = unsafe { node_mem.align_to_mut::<RmapNode>() };
        if !head_prefix.is_empty() || !node_prefix.is_empty() || nodes.is_empty() {
            return Err(Error::ReverseMapTooSmall);
        }
        let pool = nodes.len().min(NIL as usize);
        let mut map = Self {
            window_start,
            heads: &mut heads[..frames],
            nodes: &mut nodes[..pool],
            free_head: NIL,
            free_count: 0,
        };
        map.reset();
        Ok(map)
    }

    /// Empties every list and returns all nodes to the pool.
    pub fn reset(&mut self) {
        self.heads.fill(NIL);
        let count = self.nodes.len();
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.pte_addr = 0;
            node.next = if i + 1 < count { (i + 1) as u32 } else { NIL };
        }
        self.free_head = 0;
        self.free_count = count;
    }

    /// Returns the number of nodes left in the pool.
    pub fn free_nodes(&self) -> usize {
        self.free_count
    }

    /// Returns the addresses of the entries currently recorded as mapping `pfn`.
    pub fn ptes_for(&self, pfn: Pfn) -> impl Iterator<Item = u64> + '_ {
        let mut cur = self
            .clamp(pfn, 1)
            .next()
            .map(|i| self.heads[i])
            .unwrap_or(NIL);
        core::iter::from_fn(move || {
            if cur == NIL {
                return None;
            }
            let node = &self.nodes[cur as usize];
            cur = node.next;
            Some(node.pte_addr)
        })
    }

    // Returns the head indices of the frames in `[pfn, pfn + count)` that fall in the window.
    fn clamp(&self, pfn: Pfn, count: u64) -> Range<usize> {
        let window_start = self.window_start.bits();
        let window_end = window_start + self.heads.len() as u64;
        let start = pfn.bits().max(window_start);
        let end = pfn.bits().saturating_add(count).min(window_end);
        if start >= end {
            return 0..0;
        }
        (start - window_start) as usize..(end - window_start) as usize
    }

    fn alloc(&mut self) -> Option<u32> {
        if self.free_head == NIL {
            return None;
        }
        let idx = self.free_head;
        self.free_head = self.nodes[idx as usize].next;
        self.free_count -= 1;
        Some(idx)
    }

    fn release(&mut self, idx: u32) {
        self.nodes[idx as usize].next = self.free_head;
        self.free_head = idx;
        self.free_count += 1;
    }

    // Unlinks the first node for `pte_addr` from the list of frame `head`. Returns false if the
    // list holds no such node.
    fn unlink(&mut self, head: usize, pte_addr: u64) -> bool {
        let mut prev = NIL;
        let mut cur = self.heads[head];
        while cur != NIL {
            let node = self.nodes[cur as usize];
            if node.pte_addr == pte_addr {
                if prev == NIL {
                    self.heads[head] = node.next;
                } else {
                    self.nodes[prev as usize].next = node.next;
                }
                self.release(cur);
                return true;
            }
            prev = cur;
            cur = node.next;
        }
        false
    }

    /// Records that the entry at `pte_addr` maps the `page_count` frames starting at `pte.pfn()`.
    /// Frames outside the window aren't recorded. Fails without changing the map if the pool
    /// can't cover every recorded frame.
    pub fn add(&mut self, pte: Pte, pte_addr: u64, page_count: u64) -> Result<()> {
        let range = self.clamp(pte.pfn(), page_count);
        if range.len() > self.free_count {
            return Err(Error::OutOfNodes);
        }
        for head in range {
            // The pool was checked above.
            let idx = self.alloc().ok_or(Error::OutOfNodes)?;
            self.nodes[idx as usize] = RmapNode {
                pte_addr,
                next: self.heads[head],
                _pad: 0,
            };
            self.heads[head] = idx;
        }
        Ok(())
    }

    /// Removes the records added for the same entry. Missing records are ignored.
    pub fn delete(&mut self, pte: Pte, pte_addr: u64, page_count: u64) {
        for head in self.clamp(pte.pfn(), page_count) {
            self.unlink(head, pte_addr);
        }
    }

    /// Clears the valid bit of every entry mapping a frame in `[start, start + num)` and drops
    /// their records from every frame they cover.
    pub fn invalidate_range(&mut self, hpt: &mut HptArea, start: Pfn, num: u64) -> Result<()> {
        for head in self.clamp(start, num) {
            let pfn = Pfn::new(self.window_start.bits() + head as u64);
            while self.heads[head] != NIL {
                let node = self.heads[head];
                let pte_addr = self.nodes[node as usize].pte_addr;
                let span = hpt.layout().page_span(pte_addr)?;
                let pte = hpt.read(pte_addr)?;
                if pte.valid_leaf() && pte.pfn().overlaps(span, pfn, 1) {
                    hpt.write(pte_addr, pte.invalidated())?;
                    self.delete(pte, pte_addr, span);
                }
                // A record whose entry no longer maps this frame is stale; drop it alone.
                if self.heads[head] == node {
                    self.unlink(head, pte_addr);
                }
            }
        }
        Ok(())
    }
}

impl MappingTracker for ReverseMap {
    fn track(&mut self, pte_addr: u64, pte: Pte, page_count: u64) -> Result<()> {
        self.add(pte, pte_addr, page_count)
    }

    fn untrack(&mut self, pte_addr: u64, pte: Pte, page_count: u64) {
        self.delete(pte, pte_addr, page_count)
    }

    fn rebuild(&mut self, hpt: &HptArea) -> Result<()> {
        self.reset();
        for (addr, pte, span) in hpt.valid_leaves() {
            self.add(pte, addr, span)?;
        }
        Ok(())
    }

    fn unmap_range(&mut self, hpt: &mut HptArea, start: Pfn, num: u64) -> Result<()> {
        self.invalidate_range(hpt, start, num)
    }
}
