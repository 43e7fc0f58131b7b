// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Stop, Disposition, Handler, SYS_* IDs
//! DEPENDS_ON: cap, env, ipc, mm, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs and error codes; decode/check/execute discipline

pub mod api;

#[cfg(test)]
mod tests_prop;

use core::fmt;

use crate::trap::TrapFrame;
use crate::{cap, env, ipc, mm};

/// Maximum number of syscalls supported by the dispatch table.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Stop>;

/// Syscall arguments a1..a5 (a0 carries the syscall number).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Args {
    regs: [usize; 5],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 5]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }

    /// Decodes `(number, args)` from a saved frame: number in eax, then
    /// edx, ecx, ebx, edi, esi.
    pub fn from_frame(tf: &TrapFrame) -> (usize, Self) {
        let r = &tf.regs;
        let regs = [r.edx, r.ecx, r.ebx, r.edi, r.esi].map(|w| w as usize);
        (r.eax as usize, Self { regs })
    }
}

/// Public syscall numbers.
pub const SYS_CPUTS: usize = 0;
pub const SYS_CGETC: usize = 1;
pub const SYS_GETENVID: usize = 2;
pub const SYS_ENV_DESTROY: usize = 3;
pub const SYS_PAGE_ALLOC: usize = 4;
pub const SYS_PAGE_MAP: usize = 5;
pub const SYS_PAGE_UNMAP: usize = 6;
pub const SYS_EXOFORK: usize = 7;
pub const SYS_ENV_SET_STATUS: usize = 8;
pub const SYS_ENV_SET_TRAPFRAME: usize = 9;
pub const SYS_ENV_SET_PGFAULT_UPCALL: usize = 10;
pub const SYS_YIELD: usize = 11;
/// Non-blocking send; fails with `IpcNotRecv` unless the target waits in recv.
pub const SYS_IPC_TRY_SEND: usize = 12;
/// Blocking receive; resumes with 0 once a sender delivers.
pub const SYS_IPC_RECV: usize = 13;

/// Error codes visible to user environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Environment does not exist or the caller lacks authority over it.
    BadEnv,
    /// Invalid argument, including unknown syscall numbers.
    Inval,
    /// Out of physical frames.
    NoMem,
    /// Environment table is full.
    NoFreeEnv,
    /// Target is not waiting in recv.
    IpcNotRecv,
}

impl Error {
    /// Negative ABI code returned in the caller's result register.
    pub const fn code(self) -> isize {
        match self {
            Error::BadEnv => -2,
            Error::Inval => -3,
            Error::NoMem => -4,
            Error::NoFreeEnv => -5,
            Error::IpcNotRecv => -7,
        }
    }
}

impl From<cap::CapError> for Error {
    fn from(_: cap::CapError) -> Self {
        Self::BadEnv
    }
}

impl From<mm::MapError> for Error {
    fn from(value: mm::MapError) -> Self {
        match value {
            mm::MapError::OutOfMemory => Self::NoMem,
            mm::MapError::Unaligned | mm::MapError::OutOfRange | mm::MapError::InvalidFlags => {
                Self::Inval
            }
        }
    }
}

impl From<mm::FrameError> for Error {
    fn from(_: mm::FrameError) -> Self {
        Self::NoMem
    }
}

impl From<env::EnvError> for Error {
    fn from(value: env::EnvError) -> Self {
        match value {
            env::EnvError::NoFreeEnv => Self::NoFreeEnv,
            env::EnvError::NoMem => Self::NoMem,
        }
    }
}

impl From<ipc::IpcError> for Error {
    fn from(value: ipc::IpcError) -> Self {
        match value {
            ipc::IpcError::Capability(err) => err.into(),
            ipc::IpcError::NotReceiving => Self::IpcNotRecv,
            ipc::IpcError::NoMem => Self::NoMem,
            ipc::IpcError::Unaligned
            | ipc::IpcError::BadPerm
            | ipc::IpcError::NoSourcePage
            | ipc::IpcError::WriteEscalation => Self::Inval,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why a handler did not produce a return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Ordinary failure reported to the caller as a negative code.
    Error(Error),
    /// Caller gave up the CPU; its saved frame already holds the value it
    /// will observe when resumed.
    Block,
    /// Caller was destroyed and must never resume.
    Exit,
}

impl From<Error> for Stop {
    fn from(value: Error) -> Self {
        Self::Error(value)
    }
}

impl From<cap::CapError> for Stop {
    fn from(value: cap::CapError) -> Self {
        Self::Error(value.into())
    }
}

impl From<mm::MapError> for Stop {
    fn from(value: mm::MapError) -> Self {
        Self::Error(value.into())
    }
}

impl From<mm::FrameError> for Stop {
    fn from(value: mm::FrameError) -> Self {
        Self::Error(value.into())
    }
}

impl From<env::EnvError> for Stop {
    fn from(value: env::EnvError) -> Self {
        Self::Error(value.into())
    }
}

impl From<ipc::IpcError> for Stop {
    fn from(value: ipc::IpcError) -> Self {
        Self::Error(value.into())
    }
}

impl From<mm::UserFault> for Stop {
    fn from(_: mm::UserFault) -> Self {
        Self::Exit
    }
}

/// What the trap-exit path does with the caller after a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Value (or negative error code) written into the caller's `eax`.
    Return(isize),
    /// Caller is parked or yielded; another environment may be running now.
    Suspended,
    /// Caller was destroyed.
    Terminated,
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        #[cfg(feature = "trace_syscalls")]
        log_trace!(target: "syscall", "dispatch {} {:x?}", number, args);
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Stop::Error(Error::Inval))
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
