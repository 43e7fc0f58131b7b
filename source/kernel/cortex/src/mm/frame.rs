// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Reference-counted physical frame pool
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Frames (alloc/free/incref/decref/refcount/live/read/write), FrameId, FrameError
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: All refcount updates serialized by one lock; a frame is free iff refs == 0 and
//!             it is not held by a caller between alloc and its first incref

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use core::fmt;
#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::PAGE_SIZE;

/// Handle naming one physical frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FrameId(u32);

impl FrameId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Simulated physical address of the frame.
    #[inline]
    pub const fn phys_addr(self) -> usize {
        self.index() * PAGE_SIZE
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// Errors reported by the frame pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// No free frame is left in the pool.
    OutOfMemory,
}

struct FrameSlot {
    refs: u32,
    allocated: bool,
    data: Box<[u8; PAGE_SIZE]>,
}

struct FrameTable {
    slots: Vec<FrameSlot>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl FrameTable {
    fn slot(&self, id: FrameId) -> &FrameSlot {
        &self.slots[id.index()]
    }

    fn slot_mut(&mut self, id: FrameId) -> &mut FrameSlot {
        &mut self.slots[id.index()]
    }

    fn release(&mut self, id: FrameId) {
        let slot = self.slot_mut(id);
        debug_assert!(slot.allocated, "double free of {}", id);
        debug_assert_eq!(slot.refs, 0, "freeing referenced {}", id);
        if !slot.allocated {
            log_error!(target: "mm", "FRAME: double free of {}", id);
            return;
        }
        slot.allocated = false;
        self.free.push(id.0);
        self.live -= 1;
    }
}

/// Fixed-capacity pool of 4 KiB frames shared by every address space.
///
/// Backing storage is materialised lazily, so a large capacity costs nothing
/// until frames are actually handed out.
pub struct Frames {
    table: Mutex<FrameTable>,
    #[cfg(feature = "failpoints")]
    deny_next: AtomicBool,
}

impl Frames {
    /// Creates a pool able to hand out at most `capacity` frames at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(FrameTable {
                slots: Vec::new(),
                free: Vec::new(),
                capacity,
                live: 0,
            }),
            #[cfg(feature = "failpoints")]
            deny_next: AtomicBool::new(false),
        }
    }

    /// Forces the next [`Frames::alloc`] on this pool to report exhaustion.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_alloc(&self) {
        self.deny_next.store(true, Ordering::SeqCst);
    }

    /// Allocates a frame with a reference count of zero.
    ///
    /// Recycled frames keep their previous contents unless `zero` is set.
    pub fn alloc(&self, zero: bool) -> Result<FrameId, FrameError> {
        #[cfg(feature = "failpoints")]
        if self.deny_next.swap(false, Ordering::SeqCst) {
            return Err(FrameError::OutOfMemory);
        }
        let mut table = self.table.lock();
        let id = if let Some(raw) = table.free.pop() {
            let id = FrameId(raw);
            let slot = table.slot_mut(id);
            if zero {
                slot.data.fill(0);
            }
            id
        } else if table.slots.len() < table.capacity {
            let id = FrameId(table.slots.len() as u32);
            table.slots.push(FrameSlot {
                refs: 0,
                allocated: false,
                data: Box::new([0; PAGE_SIZE]),
            });
            id
        } else {
            return Err(FrameError::OutOfMemory);
        };
        let slot = table.slot_mut(id);
        slot.allocated = true;
        slot.refs = 0;
        table.live += 1;
        Ok(id)
    }

    /// Returns an unreferenced frame to the pool.
    pub fn free(&self, id: FrameId) {
        self.table.lock().release(id);
    }

    /// Adds one mapping reference to `id`.
    pub fn incref(&self, id: FrameId) {
        let mut table = self.table.lock();
        let slot = table.slot_mut(id);
        debug_assert!(slot.allocated, "incref on free {}", id);
        slot.refs += 1;
    }

    /// Drops one reference to `id`, freeing the frame when none remain.
    pub fn decref(&self, id: FrameId) {
        let mut table = self.table.lock();
        let slot = table.slot_mut(id);
        debug_assert!(slot.refs > 0, "decref underflow on {}", id);
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            table.release(id);
        }
    }

    /// Returns the number of references currently held on `id`.
    pub fn refcount(&self, id: FrameId) -> u32 {
        let table = self.table.lock();
        table.slots.get(id.index()).map(|slot| slot.refs).unwrap_or(0)
    }

    /// Returns whether `id` is currently handed out.
    pub fn is_allocated(&self, id: FrameId) -> bool {
        let table = self.table.lock();
        table.slots.get(id.index()).map(|slot| slot.allocated).unwrap_or(false)
    }

    /// Number of frames currently allocated.
    pub fn live(&self) -> usize {
        self.table.lock().live
    }

    /// Number of frames that can still be allocated.
    pub fn available(&self) -> usize {
        let table = self.table.lock();
        table.capacity - table.live
    }

    /// Copies `buf.len()` bytes starting at `offset` within the frame into `buf`.
    pub fn read(&self, id: FrameId, offset: usize, buf: &mut [u8]) {
        let table = self.table.lock();
        let data = &table.slot(id).data;
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copies `bytes` into the frame starting at `offset`.
    pub fn write(&self, id: FrameId, offset: usize, bytes: &[u8]) {
        let mut table = self.table.lock();
        let data = &mut table.slot_mut(id).data;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}
