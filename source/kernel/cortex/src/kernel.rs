// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state aggregate and the trap-exit contract
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (new/with_scheduler/create_env/run/syscall/trap_syscall/page_fault)
//! DEPENDS_ON: env, mm, sched::Scheduler, hal::Console, syscall::{SyscallTable, api}
//! INVARIANTS: All mutation goes through &mut Kernel (one active context);
//!             return values land in the caller's saved eax; block/exit always reschedule

extern crate alloc;

use alloc::boxed::Box;

use static_assertions::assert_impl_all;

use crate::config::KernelConfig;
use crate::env::{Env, EnvId, EnvStatus, EnvTable};
use crate::hal::Console;
use crate::mm::{user_mem_assert, Frames, PteFlags, PAGE_SIZE, UXSTACK_TOP};
use crate::sched::{RoundRobin, Scheduler};
use crate::syscall::{api, Args, Disposition, Error, Stop, SyscallTable};
use crate::trap::{FaultDelivery, UTrapframe, T_PGFLT, T_SYSCALL};

/// The exokernel: frames, environments, dispatch table and collaborators.
pub struct Kernel {
    frames: Frames,
    envs: EnvTable,
    table: SyscallTable,
    scheduler: Box<dyn Scheduler>,
    console: Box<dyn Console + Send>,
}

assert_impl_all!(Kernel: Send);

impl Kernel {
    /// Builds a kernel with round-robin scheduling.
    pub fn new(config: KernelConfig, console: impl Console + Send + 'static) -> Self {
        let mut table = SyscallTable::new();
        api::install_handlers(&mut table);
        log_info!(
            target: "kernel",
            "cortex up: {} env slots, {} frames",
            config.env_capacity(),
            config.frame_capacity()
        );
        Self {
            frames: Frames::new(config.frame_capacity()),
            envs: EnvTable::new(config.env_capacity()),
            table,
            scheduler: Box::new(RoundRobin),
            console: Box::new(console),
        }
    }

    /// Replaces the scheduling policy.
    pub fn with_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    pub fn frames(&self) -> &Frames {
        &self.frames
    }

    pub fn envs(&self) -> &EnvTable {
        &self.envs
    }

    pub fn env(&self, id: EnvId) -> Option<&Env> {
        self.envs.get(id)
    }

    pub fn env_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.envs.get_mut(id)
    }

    pub fn current(&self) -> Option<EnvId> {
        self.envs.current()
    }

    /// Creates a runnable environment with an empty address space, as the
    /// loader does for boot-time programs.
    pub fn create_env(&mut self, parent: Option<EnvId>) -> Result<EnvId, Error> {
        let id = self.envs.alloc(parent, &self.frames)?;
        if let Some(env) = self.envs.get_mut(id) {
            env.set_status(EnvStatus::Runnable);
        }
        log_info!(target: "env", "[00000000] new env {}", id);
        Ok(id)
    }

    /// Switches to `id`.
    pub fn run(&mut self, id: EnvId) -> Result<(), Error> {
        if self.envs.get(id).is_none() {
            return Err(Error::BadEnv);
        }
        if self.envs.run(id) {
            Ok(())
        } else {
            Err(Error::Inval)
        }
    }

    /// Asks the scheduler for the next environment and switches to it.
    pub fn schedule(&mut self) -> Option<EnvId> {
        match self.scheduler.pick_next(&self.envs) {
            Some(next) if self.envs.run(next) => Some(next),
            Some(next) => {
                log_warn!(target: "sched", "policy picked unrunnable env {}", next);
                self.envs.idle();
                None
            }
            None => {
                log_info!(target: "sched", "no runnable environments");
                self.envs.idle();
                None
            }
        }
    }

    /// Runs syscall `number` on behalf of the current environment.
    pub fn syscall(&mut self, number: usize, args: Args) -> Disposition {
        let caller = self.envs.current();
        let outcome = {
            let mut ctx = api::Context::new(&mut self.envs, &self.frames, &mut *self.console);
            self.table.dispatch(number, &mut ctx, &args)
        };
        match outcome {
            Ok(value) => self.complete(caller, value as isize),
            Err(Stop::Error(err)) => {
                log_debug!(target: "syscall", "sys {} -> {}", number, err);
                self.complete(caller, err.code())
            }
            Err(Stop::Block) => {
                self.schedule();
                Disposition::Suspended
            }
            Err(Stop::Exit) => {
                self.schedule();
                Disposition::Terminated
            }
        }
    }

    /// Syscall trap entry: decodes number and arguments from the current
    /// environment's saved registers.
    pub fn trap_syscall(&mut self) -> Disposition {
        let Some(env) = self.envs.current().and_then(|id| self.envs.get_mut(id)) else {
            return Disposition::Return(Error::BadEnv.code());
        };
        env.frame_mut().trapno = T_SYSCALL;
        let (number, args) = Args::from_frame(env.frame());
        self.syscall(number, args)
    }

    fn complete(&mut self, caller: Option<EnvId>, value: isize) -> Disposition {
        if let Some(env) = caller.and_then(|id| self.envs.get_mut(id)) {
            env.frame_mut().regs.eax = value as u32;
        }
        Disposition::Return(value)
    }

    /// Delivers a page fault at `fault_va` to the current environment's upcall.
    ///
    /// Without an upcall, or when the exception stack is not mapped writable,
    /// the environment is destroyed and another one is scheduled.
    pub fn page_fault(&mut self, fault_va: usize, err: u32) -> Result<FaultDelivery, Error> {
        let id = self.envs.current().ok_or(Error::BadEnv)?;
        let env = self.envs.get_mut(id).ok_or(Error::BadEnv)?;
        let tf = env.frame_mut();
        tf.trapno = T_PGFLT;
        tf.err = err;
        let tf = *tf;

        let Some(entry) = env.pgfault_upcall() else {
            log_warn!(
                target: "trap",
                "[{}] user fault va {:08x} ip {:08x}",
                id,
                fault_va,
                tf.eip
            );
            self.envs.destroy(id, &self.frames);
            self.schedule();
            return Ok(FaultDelivery::Destroyed);
        };

        // A fault taken on the exception stack nests below the current frame,
        // leaving one scratch word.
        let esp = tf.esp as usize;
        let base = if (UXSTACK_TOP - PAGE_SIZE..UXSTACK_TOP).contains(&esp) {
            esp - UTrapframe::SIZE - 4
        } else {
            UXSTACK_TOP - UTrapframe::SIZE
        };
        let checked =
            user_mem_assert(&mut self.envs, &self.frames, id, base, UTrapframe::SIZE, PteFlags::WRITABLE);
        if checked.is_err() {
            self.schedule();
            return Ok(FaultDelivery::Destroyed);
        }

        let utf = UTrapframe::capture(fault_va as u32, &tf);
        let env = self.envs.get_mut(id).ok_or(Error::BadEnv)?;
        env.space()
            .ok_or(Error::BadEnv)?
            .copy_to_user(&self.frames, base, &utf.to_bytes())
            .map_err(|_| Error::Inval)?;
        let tf = env.frame_mut();
        tf.eip = entry as u32;
        tf.esp = base as u32;
        log_debug!(target: "trap", "[{}] upcall {:08x} frame {:08x}", id, entry, base);
        Ok(FaultDelivery::Upcall { entry, frame: base })
    }

    /// Writes into an environment's memory as if the environment itself had
    /// stored the bytes; permissions are not consulted.
    pub fn copy_to_user(&self, id: EnvId, va: usize, bytes: &[u8]) -> Result<(), Error> {
        let space = self.envs.get(id).and_then(Env::space).ok_or(Error::BadEnv)?;
        space.copy_to_user(&self.frames, va, bytes).map_err(|_| Error::Inval)
    }

    /// Reads an environment's memory.
    pub fn copy_from_user(&self, id: EnvId, va: usize, buf: &mut [u8]) -> Result<(), Error> {
        let space = self.envs.get(id).and_then(Env::space).ok_or(Error::BadEnv)?;
        space.copy_from_user(&self.frames, va, buf).map_err(|_| Error::Inval)
    }
}
