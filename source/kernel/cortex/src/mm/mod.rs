// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory management (frames, page tables, address spaces, user access checks)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Frames, FrameId, PageTable, Pte, PteFlags, AddressSpace, user_mem_check/assert
//! DEPENDS_ON: bitflags, spin
//! INVARIANTS: Every mapped frame holds one reference per mapping; table frames are accounted
//!
//! Memory layout seen by user environments:
//!
//! ```text
//!  USER_TOP, UXSTACK_TOP -> +------------------------------+ 0xeec00000
//!                           |   user exception stack       | PAGE_SIZE
//!                           +------------------------------+
//!                           |   empty guard page           | PAGE_SIZE
//!       USTACK_TOP -------> +------------------------------+ 0xeebfe000
//!                           |   normal user stack ...      |
//! ```

pub mod address_space;
pub mod frame;
pub mod page_table;
pub mod uaccess;

#[cfg(test)]
mod tests_prop;

pub use address_space::AddressSpace;
pub use frame::{FrameError, FrameId, Frames};
pub use page_table::{MapError, PageTable, Pte, PteFlags};
pub use uaccess::{user_mem_assert, user_mem_check, UserFault};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// First address user environments may not name in syscalls.
pub const USER_TOP: usize = 0xeec0_0000;
/// Top of the one-page user exception stack used for fault upcalls.
pub const UXSTACK_TOP: usize = USER_TOP;
/// Top of the normal user stack (one guard page below the exception stack).
pub const USTACK_TOP: usize = USER_TOP - 2 * PAGE_SIZE;
