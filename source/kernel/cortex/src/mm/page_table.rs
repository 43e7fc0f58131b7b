// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level page table with lazily allocated leaf tables.
//!
//! Entries are kept as typed values next to the frame that backs each table
//! level, so frame accounting matches hardware while nothing outside this
//! module ever computes an entry address.

extern crate alloc;

use alloc::{boxed::Box, vec, vec::Vec};

use bitflags::bitflags;

use super::frame::{FrameId, Frames};
use super::PAGE_SIZE;
use crate::types::VirtAddr;

/// Number of entries per directory or leaf table.
const PT_ENTRIES: usize = 1024;
const PT_SHIFT: usize = 12;
const PD_SHIFT: usize = 22;
/// First address beyond what the two-level walk can translate.
const VA_LIMIT: u64 = 1 << 32;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Flags stored in a page-table entry.
    pub struct PteFlags: u32 {
        const PRESENT = 0x001;
        const WRITABLE = 0x002;
        const USER = 0x004;
        /// Software-available bits, never interpreted by the kernel.
        const AVAIL = 0xe00;
    }
}

impl PteFlags {
    /// Flags that must be present on every user-visible mapping.
    pub const USER_PRESENT: Self = Self::PRESENT.union(Self::USER);

    /// Decodes a permission word supplied by user code.
    ///
    /// Rejects unknown bits and words missing PRESENT or USER.
    pub fn from_user(raw: usize) -> Option<Self> {
        let bits = u32::try_from(raw).ok()?;
        Self::from_bits(bits).filter(|flags| flags.contains(Self::USER_PRESENT))
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address was not page aligned.
    Unaligned,
    /// Virtual address is outside the translatable range.
    OutOfRange,
    /// Flags do not describe a present entry.
    InvalidFlags,
    /// No frame was available for an intermediate table.
    OutOfMemory,
}

/// A single leaf mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    pub frame: FrameId,
    pub flags: PteFlags,
}

impl Pte {
    #[inline]
    pub fn permits(&self, required: PteFlags) -> bool {
        self.flags.contains(required)
    }
}

struct LeafTable {
    frame: FrameId,
    entries: Box<[Option<Pte>]>,
}

/// Page directory plus the leaf tables it references.
pub struct PageTable {
    root: FrameId,
    dir: Vec<Option<LeafTable>>,
}

impl PageTable {
    /// Creates an empty table, allocating the directory frame.
    pub fn new(frames: &Frames) -> Result<Self, MapError> {
        let root = frames.alloc(true).map_err(|_| MapError::OutOfMemory)?;
        frames.incref(root);
        let dir = (0..PT_ENTRIES).map(|_| None).collect();
        Ok(Self { root, dir })
    }

    /// Frame holding the directory.
    pub fn root(&self) -> FrameId {
        self.root
    }

    /// Looks up the mapping covering `va` (any offset within the page).
    pub fn lookup(&self, va: usize) -> Option<Pte> {
        if va as u64 >= VA_LIMIT {
            return None;
        }
        let (pdx, ptx) = indices(va);
        self.dir[pdx].as_ref().and_then(|leaf| leaf.entries[ptx])
    }

    /// Installs `frame` at `va`, replacing any previous mapping.
    ///
    /// The new frame gains a reference before the old one is released, so
    /// re-inserting the frame already mapped at `va` is harmless.
    pub fn insert(
        &mut self,
        frames: &Frames,
        va: usize,
        frame: FrameId,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if va as u64 >= VA_LIMIT {
            return Err(MapError::OutOfRange);
        }
        if !flags.contains(PteFlags::PRESENT) {
            return Err(MapError::InvalidFlags);
        }
        let (pdx, ptx) = indices(va);
        let slot = &mut self.dir[pdx];
        if slot.is_none() {
            let table_frame = frames.alloc(true).map_err(|_| MapError::OutOfMemory)?;
            frames.incref(table_frame);
            *slot = Some(LeafTable {
                frame: table_frame,
                entries: vec![None; PT_ENTRIES].into_boxed_slice(),
            });
        }
        let Some(leaf) = slot.as_mut() else {
            return Err(MapError::OutOfMemory);
        };
        frames.incref(frame);
        if let Some(old) = leaf.entries[ptx].replace(Pte { frame, flags }) {
            frames.decref(old.frame);
        }
        Ok(())
    }

    /// Removes the mapping at `va`, dropping its frame reference.
    pub fn remove(&mut self, frames: &Frames, va: usize) -> Option<Pte> {
        if va as u64 >= VA_LIMIT {
            return None;
        }
        let (pdx, ptx) = indices(va);
        let old = self.dir[pdx].as_mut().and_then(|leaf| leaf.entries[ptx].take())?;
        frames.decref(old.frame);
        Some(old)
    }

    /// Iterates over every leaf mapping in ascending address order.
    pub fn mappings(&self) -> impl Iterator<Item = (VirtAddr, Pte)> + '_ {
        self.dir.iter().enumerate().flat_map(|(pdx, leaf)| {
            leaf.iter().flat_map(move |leaf| {
                leaf.entries.iter().enumerate().filter_map(move |(ptx, entry)| {
                    entry.map(|pte| (VirtAddr::new(pdx << PD_SHIFT | ptx << PT_SHIFT), pte))
                })
            })
        })
    }

    /// Number of frames consumed by the table structure itself.
    pub fn table_frames(&self) -> usize {
        1 + self.dir.iter().filter(|leaf| leaf.is_some()).count()
    }

    /// Releases every mapping and every table frame.
    pub fn teardown(mut self, frames: &Frames) {
        for leaf in self.dir.drain(..).flatten() {
            for pte in leaf.entries.iter().flatten() {
                frames.decref(pte.frame);
            }
            frames.decref(leaf.frame);
        }
        frames.decref(self.root);
    }
}

#[inline]
fn indices(va: usize) -> (usize, usize) {
    ((va >> PD_SHIFT) & (PT_ENTRIES - 1), (va >> PT_SHIFT) & (PT_ENTRIES - 1))
}
