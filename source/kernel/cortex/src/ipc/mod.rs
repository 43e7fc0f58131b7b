// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous single-slot IPC rendezvous with optional page transfer
//! OWNERS: @runtime
//! PUBLIC API: IpcState, IpcError, recv(envs,caller,dstva), try_send(envs,frames,caller,...)
//! DEPENDS_ON: cap (resolution), env::EnvTable, mm (page lookup/insert)
//! INVARIANTS: `from` is Some only between a delivered send and the receiver's next recv;
//!             every check precedes the first mutation of the receiver
//!
//! A receiver parks itself with [`recv`]; a sender either finds it parked and
//! completes the handoff in one step, or fails with [`IpcError::NotReceiving`]
//! and retries. There is no queue.

use crate::cap::{Authority, CapError};
use crate::env::{EnvId, EnvStatus, EnvTable};
use crate::mm::{Frames, MapError, PteFlags, USER_TOP};
use crate::types::VirtAddr;

/// Per-environment receive state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcState {
    /// Blocked in `recv` and not yet served.
    pub receiving: bool,
    /// Sender of the last delivered message.
    pub from: Option<EnvId>,
    /// Value of the last delivered message.
    pub value: u32,
    /// Page the receiver is willing to accept, if any.
    pub dstva: Option<VirtAddr>,
    /// Permissions of the transferred page; empty when none was transferred.
    pub perm: PteFlags,
}

/// Errors reported by the rendezvous engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Target could not be resolved.
    Capability(CapError),
    /// Target is not blocked in `recv`, or another sender already won.
    NotReceiving,
    /// Page address below USER_TOP is not page aligned.
    Unaligned,
    /// Permission word is not a legal user permission.
    BadPerm,
    /// Sender offered a page it has not mapped.
    NoSourcePage,
    /// Sender asked to grant write access it does not hold.
    WriteEscalation,
    /// Mapping into the receiver needed a frame that was not available.
    NoMem,
}

impl From<CapError> for IpcError {
    fn from(value: CapError) -> Self {
        Self::Capability(value)
    }
}

impl From<MapError> for IpcError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::NoMem,
            MapError::InvalidFlags => Self::BadPerm,
            MapError::Unaligned | MapError::OutOfRange => Self::Unaligned,
        }
    }
}

/// Parks `caller` waiting for a message.
///
/// `dstva` at or above [`USER_TOP`] means no page is wanted. On success the
/// caller is `NotRunnable`; the syscall return value is written by the sender.
pub fn recv(envs: &mut EnvTable, caller: EnvId, dstva: usize) -> Result<(), IpcError> {
    let dstva = if dstva < USER_TOP {
        Some(VirtAddr::user_page(dstva).ok_or(IpcError::Unaligned)?)
    } else {
        None
    };
    let env = envs.get_mut(caller).ok_or(IpcError::Capability(CapError::Stale))?;
    env.ipc.receiving = true;
    env.ipc.dstva = dstva;
    env.ipc.from = None;
    env.set_status(EnvStatus::NotRunnable);
    Ok(())
}

/// Attempts to deliver `value` (and optionally the page at `srcva`) to `target`.
pub fn try_send(
    envs: &mut EnvTable,
    frames: &Frames,
    caller: EnvId,
    target: u32,
    value: u32,
    srcva: usize,
    perm: usize,
) -> Result<(), IpcError> {
    let target = envs.resolve(target, Authority::Any)?;
    let receiver = envs.get(target).ok_or(IpcError::Capability(CapError::Stale))?.ipc;
    if !receiver.receiving || receiver.from.is_some() {
        return Err(IpcError::NotReceiving);
    }

    // Decide on the page before touching the receiver.
    let mut grant = None;
    if srcva < USER_TOP {
        let srcva = VirtAddr::user_page(srcva).ok_or(IpcError::Unaligned)?;
        let perm = PteFlags::from_user(perm).ok_or(IpcError::BadPerm)?;
        let pte = envs
            .get(caller)
            .and_then(|env| env.space())
            .and_then(|space| space.lookup(srcva.raw()))
            .ok_or(IpcError::NoSourcePage)?;
        if perm.contains(PteFlags::WRITABLE) && !pte.permits(PteFlags::WRITABLE) {
            return Err(IpcError::WriteEscalation);
        }
        if let Some(dstva) = receiver.dstva {
            grant = Some((pte.frame, dstva, perm));
        }
    }

    let env = envs.get_mut(target).ok_or(IpcError::Capability(CapError::Stale))?;
    let mut transferred = PteFlags::empty();
    if let Some((frame, dstva, perm)) = grant {
        let space = env.space_mut().ok_or(IpcError::Capability(CapError::Stale))?;
        space.map(frames, dstva, frame, perm)?;
        transferred = perm;
    }
    env.ipc.receiving = false;
    env.ipc.from = Some(caller);
    env.ipc.value = value;
    env.ipc.perm = transferred;
    env.set_status(EnvStatus::Runnable);
    env.frame_mut().regs.eax = 0;
    log_debug!(
        target: "ipc",
        "[{}] sent {:#x} to {} (perm {:#x})",
        caller,
        value,
        target,
        transferred.bits()
    );
    Ok(())
}
