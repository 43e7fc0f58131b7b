// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Environment id resolution and the caller-authority rule
//! OWNERS: @kernel-cap-team
//! PUBLIC API: EnvTable::resolve(raw, Authority), Authority, CapError
//! DEPENDS_ON: env::EnvTable
//! INVARIANTS: Raw id 0 names the caller; stale generations never resolve;
//!             SelfOrParent grants only the caller itself or its direct children

use core::fmt;

use crate::env::{EnvId, EnvTable};

/// Authority a syscall needs over the environment it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// Any live environment (IPC send).
    Any,
    /// The caller or an environment whose recorded parent is the caller.
    SelfOrParent,
}

/// Errors produced while resolving an environment id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    /// Id names a free slot, carries a stale generation, or no caller exists for id 0.
    Stale,
    /// Environment exists but the caller holds no authority over it.
    Denied,
}

impl fmt::Display for CapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl EnvTable {
    /// Resolves a raw id supplied by the current environment.
    pub fn resolve(&self, raw: u32, authority: Authority) -> Result<EnvId, CapError> {
        let caller = self.current();
        if raw == EnvId::SELF {
            return caller.ok_or(CapError::Stale);
        }
        let id = EnvId::from_raw(raw);
        let env = self.get(id).ok_or(CapError::Stale)?;
        match authority {
            Authority::Any => Ok(id),
            Authority::SelfOrParent => {
                let caller = caller.ok_or(CapError::Denied)?;
                if id == caller || env.parent() == Some(caller) {
                    Ok(id)
                } else {
                    Err(CapError::Denied)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests_prop;
