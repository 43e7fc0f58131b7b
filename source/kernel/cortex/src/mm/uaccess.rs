// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Validation of user-supplied buffers before the kernel touches them
//! OWNERS: @kernel-mm-team
//! PUBLIC API: user_mem_check(space,va,len,perm), user_mem_assert(...), UserFault
//! DEPENDS_ON: mm::AddressSpace, env::EnvTable
//! INVARIANTS: Ranges must stay below USER_TOP; every spanned page carries perm|PRESENT|USER;
//!             a failed assertion destroys the environment instead of returning an error code

use core::fmt;

use super::address_space::AddressSpace;
use super::frame::Frames;
use super::page_table::PteFlags;
use super::{PAGE_SIZE, USER_TOP};
use crate::env::{EnvId, EnvTable};

/// Fatal outcome of a failed user memory assertion.
///
/// Not an error code: by the time this value exists the offending environment
/// has already been destroyed and must not be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserFault {
    /// Environment that was destroyed.
    pub env: EnvId,
    /// First address that failed the check.
    pub va: usize,
}

impl fmt::Display for UserFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] user fault at va {:08x}", self.env, self.va)
    }
}

/// Checks that `[va, va + len)` is accessible with `perm | PRESENT | USER`.
///
/// Returns the first offending address on failure. Zero-length ranges always pass.
pub fn user_mem_check(
    space: &AddressSpace,
    va: usize,
    len: usize,
    perm: PteFlags,
) -> Result<(), usize> {
    if len == 0 {
        return Ok(());
    }
    let required = perm | PteFlags::USER_PRESENT;
    let end = va.saturating_add(len);
    let mut page = va - va % PAGE_SIZE;
    while page < end {
        // The first page reports `va` itself, not its page base.
        let fault = page.max(va);
        if page >= USER_TOP {
            return Err(fault);
        }
        match space.lookup(page) {
            Some(pte) if pte.permits(required) => {}
            _ => return Err(fault),
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Like [`user_mem_check`], but destroys `env` on failure.
pub fn user_mem_assert(
    envs: &mut EnvTable,
    frames: &Frames,
    env: EnvId,
    va: usize,
    len: usize,
    perm: PteFlags,
) -> Result<(), UserFault> {
    let checked = match envs.get(env).and_then(|e| e.space()) {
        Some(space) => user_mem_check(space, va, len, perm),
        None => Err(va),
    };
    match checked {
        Ok(()) => Ok(()),
        Err(bad) => {
            log_warn!(target: "uaccess", "[{}] user_mem_check assertion failure for va {:08x}", env, bad);
            envs.destroy(env, frames);
            Err(UserFault { env, va: bad })
        }
    }
}
