// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-environment address space: a page table plus kernel-side user copies.

use super::frame::{FrameId, Frames};
use super::page_table::{MapError, PageTable, Pte, PteFlags};
use super::PAGE_SIZE;
use crate::types::VirtAddr;

/// Address space exclusively owned by one environment.
pub struct AddressSpace {
    table: PageTable,
}

impl AddressSpace {
    /// Creates an empty address space; fails if the directory frame is unavailable.
    pub fn new(frames: &Frames) -> Result<Self, MapError> {
        Ok(Self { table: PageTable::new(frames)? })
    }

    /// Frame holding the page directory.
    pub fn root(&self) -> FrameId {
        self.table.root()
    }

    /// Returns the mapping covering `va`, if any.
    #[inline]
    pub fn lookup(&self, va: usize) -> Option<Pte> {
        self.table.lookup(va)
    }

    /// Maps `frame` at the page `va`, replacing any previous mapping.
    pub fn map(
        &mut self,
        frames: &Frames,
        va: VirtAddr,
        frame: FrameId,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        self.table.insert(frames, va.raw(), frame, flags)
    }

    /// Removes the mapping at `va`; absent mappings are not an error.
    pub fn unmap(&mut self, frames: &Frames, va: VirtAddr) -> Option<Pte> {
        self.table.remove(frames, va.raw())
    }

    /// Number of leaf mappings currently installed.
    pub fn mapping_count(&self) -> usize {
        self.table.mappings().count()
    }

    /// Iterates over `(page, mapping)` pairs in ascending address order.
    pub fn mappings(&self) -> impl Iterator<Item = (VirtAddr, Pte)> + '_ {
        self.table.mappings()
    }

    /// Frames consumed by the page table itself (directory plus leaf tables).
    pub fn table_frames(&self) -> usize {
        self.table.table_frames()
    }

    /// Copies user memory at `va` into `buf`.
    ///
    /// Only presence is checked; callers prove permissions with
    /// [`user_mem_check`](super::user_mem_check) first. On failure the first
    /// unmapped address is returned and `buf` may be partially filled.
    pub fn copy_from_user(&self, frames: &Frames, va: usize, buf: &mut [u8]) -> Result<(), usize> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va.checked_add(done).ok_or(va)?;
            let pte = self.lookup(addr).ok_or(addr)?;
            let offset = addr % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            frames.read(pte.frame, offset, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies `bytes` into user memory at `va`, ignoring the WRITABLE bit.
    pub fn copy_to_user(&self, frames: &Frames, va: usize, bytes: &[u8]) -> Result<(), usize> {
        let mut done = 0;
        while done < bytes.len() {
            let addr = va.checked_add(done).ok_or(va)?;
            let pte = self.lookup(addr).ok_or(addr)?;
            let offset = addr % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(bytes.len() - done);
            frames.write(pte.frame, offset, &bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Drops every mapping and returns all table frames to the pool.
    pub fn destroy(self, frames: &Frames) {
        self.table.teardown(frames);
    }
}
