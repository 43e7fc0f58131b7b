// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal newtypes for safer syscall decoding (debug-friendly, low overhead)
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, EnvId, ENV_INDEX_BITS
//! DEPENDS_ON: mm::{PAGE_SIZE, USER_TOP}
//! INVARIANTS: EnvId raw values are positive i32 and never 0; user pages are aligned and below USER_TOP
//!
//! ## Newtype Rationale
//!
//! Syscall arguments arrive as untyped machine words. Decoding them into these
//! types once, at the boundary, keeps environment ids, addresses and slot
//! indices from being mixed up further down.

use core::fmt;

use crate::mm::{PAGE_SIZE, USER_TOP};

/// Number of low id bits holding the environment slot index.
pub const ENV_INDEX_BITS: u32 = 10;
const ENV_INDEX_MASK: u32 = (1 << ENV_INDEX_BITS) - 1;
/// Largest generation that keeps the composed id a positive `i32`.
const MAX_GENERATION: u32 = (i32::MAX as u32) >> ENV_INDEX_BITS;

/// Virtual address inside a user environment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Accepts `addr` only if it names a whole user page below [`USER_TOP`].
    #[inline]
    pub fn user_page(addr: usize) -> Option<Self> {
        if addr < USER_TOP && addr % PAGE_SIZE == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < USER_TOP
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 % PAGE_SIZE
    }

    #[inline]
    pub const fn page_floor(self) -> Self {
        Self(self.0 - self.0 % PAGE_SIZE)
    }

    #[inline]
    pub fn checked_add(self, v: usize) -> Option<Self> {
        self.0.checked_add(v).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Environment identifier: `generation << ENV_INDEX_BITS | slot`.
///
/// **Ownership**: Only `EnvTable` composes ids; userspace only echoes them back.
/// **Invariant**: generation is never 0, so a live id is never the "self" sentinel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EnvId(u32);

impl EnvId {
    /// Raw value userspace passes to mean "the calling environment".
    pub const SELF: u32 = 0;

    #[inline]
    pub(crate) const fn compose(index: usize, generation: u32) -> Self {
        Self((generation << ENV_INDEX_BITS) | (index as u32 & ENV_INDEX_MASK))
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Slot index inside the environment table.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 & ENV_INDEX_MASK) as usize
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.0 >> ENV_INDEX_BITS
    }
}

/// Returns the generation following `current`, skipping 0 on wrap-around.
#[inline]
pub(crate) const fn next_generation(current: u32) -> u32 {
    if current >= MAX_GENERATION {
        1
    } else {
        current + 1
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<EnvId> for u32 {
    #[inline]
    fn from(id: EnvId) -> Self {
        id.0
    }
}

impl From<EnvId> for usize {
    #[inline]
    fn from(id: EnvId) -> Self {
        id.0 as usize
    }
}
