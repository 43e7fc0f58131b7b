// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: cap (resolution), env::EnvTable, ipc, mm::{Frames, user_mem_assert}, hal::Console
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; resolution precedes argument
//!             checks; no mutation before the last check; partial allocations rolled back

use crate::cap::Authority;
use crate::env::{Env, EnvId, EnvStatus, EnvTable};
use crate::hal::Console;
use crate::ipc;
use crate::mm::{user_mem_assert, AddressSpace, Frames, PteFlags, PAGE_SIZE};
use crate::trap::TrapFrame;
use crate::types::VirtAddr;

use super::{
    Args, Error, Stop, SysResult, SyscallTable, SYS_CGETC, SYS_CPUTS, SYS_ENV_DESTROY,
    SYS_ENV_SET_PGFAULT_UPCALL, SYS_ENV_SET_STATUS, SYS_ENV_SET_TRAPFRAME, SYS_EXOFORK,
    SYS_GETENVID, SYS_IPC_RECV, SYS_IPC_TRY_SEND, SYS_PAGE_ALLOC, SYS_PAGE_MAP, SYS_PAGE_UNMAP,
    SYS_YIELD,
};

// Typed decoders for Decode→Check→Execute. Decoding never fails; ids are
// resolved before `check` so capability errors win over argument errors.

#[inline]
fn user_page(raw: usize) -> Result<VirtAddr, Error> {
    VirtAddr::user_page(raw).ok_or(Error::Inval)
}

/// Environment ids are 32-bit words; wider values never name an environment
/// and must not truncate to the caller-self id 0.
#[inline]
fn env_word(raw: usize) -> Result<u32, Error> {
    u32::try_from(raw).map_err(|_| Error::BadEnv)
}

#[inline]
fn user_perm(raw: usize) -> Result<PteFlags, Error> {
    PteFlags::from_user(raw).ok_or(Error::Inval)
}

#[derive(Copy, Clone)]
struct PageAllocArgsTyped {
    env: usize,
    va: usize,
    perm: usize,
}

impl PageAllocArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { env: args.get(0), va: args.get(1), perm: args.get(2) }
    }

    #[inline]
    fn check(&self) -> Result<(VirtAddr, PteFlags), Error> {
        Ok((user_page(self.va)?, user_perm(self.perm)?))
    }
}

#[derive(Copy, Clone)]
struct PageMapArgsTyped {
    src: usize,
    srcva: usize,
    dst: usize,
    dstva: usize,
    perm: usize,
}

impl PageMapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self {
            src: args.get(0),
            srcva: args.get(1),
            dst: args.get(2),
            dstva: args.get(3),
            perm: args.get(4),
        }
    }

    #[inline]
    fn check(&self) -> Result<(VirtAddr, VirtAddr, PteFlags), Error> {
        Ok((user_page(self.srcva)?, user_page(self.dstva)?, user_perm(self.perm)?))
    }
}

#[derive(Copy, Clone)]
struct SetStatusArgsTyped {
    env: usize,
    status: usize,
}

impl SetStatusArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { env: args.get(0), status: args.get(1) }
    }

    #[inline]
    fn check(&self) -> Result<EnvStatus, Error> {
        match EnvStatus::from_raw(self.status) {
            Some(status @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => Ok(status),
            _ => Err(Error::Inval),
        }
    }
}

/// Execution context for a syscall handler.
pub struct Context<'a> {
    pub envs: &'a mut EnvTable,
    pub frames: &'a Frames,
    pub console: &'a mut dyn Console,
}

impl<'a> Context<'a> {
    pub fn new(envs: &'a mut EnvTable, frames: &'a Frames, console: &'a mut dyn Console) -> Self {
        Self { envs, frames, console }
    }

    /// Environment that issued the syscall.
    pub fn caller(&self) -> Result<EnvId, Error> {
        self.envs.current().ok_or(Error::BadEnv)
    }

    fn resolve(&self, raw: usize) -> Result<EnvId, Error> {
        Ok(self.envs.resolve(env_word(raw)?, Authority::SelfOrParent)?)
    }
}

fn space_of(envs: &EnvTable, id: EnvId) -> Result<&AddressSpace, Error> {
    envs.get(id).and_then(Env::space).ok_or(Error::BadEnv)
}

fn space_of_mut(envs: &mut EnvTable, id: EnvId) -> Result<&mut AddressSpace, Error> {
    envs.get_mut(id).and_then(Env::space_mut).ok_or(Error::BadEnv)
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYS_CPUTS, sys_cputs);
    table.register(SYS_CGETC, sys_cgetc);
    table.register(SYS_GETENVID, sys_getenvid);
    table.register(SYS_ENV_DESTROY, sys_env_destroy);
    table.register(SYS_PAGE_ALLOC, sys_page_alloc);
    table.register(SYS_PAGE_MAP, sys_page_map);
    table.register(SYS_PAGE_UNMAP, sys_page_unmap);
    table.register(SYS_EXOFORK, sys_exofork);
    table.register(SYS_ENV_SET_STATUS, sys_env_set_status);
    table.register(SYS_ENV_SET_TRAPFRAME, sys_env_set_trapframe);
    table.register(SYS_ENV_SET_PGFAULT_UPCALL, sys_env_set_pgfault_upcall);
    table.register(SYS_YIELD, sys_yield);
    table.register(SYS_IPC_TRY_SEND, sys_ipc_try_send);
    table.register(SYS_IPC_RECV, sys_ipc_recv);
}

fn sys_cputs(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let caller = ctx.caller()?;
    let (s, len) = (args.get(0), args.get(1));
    user_mem_assert(ctx.envs, ctx.frames, caller, s, len, PteFlags::USER)?;
    let space = space_of(ctx.envs, caller)?;
    let mut chunk = [0u8; PAGE_SIZE];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(PAGE_SIZE);
        space
            .copy_from_user(ctx.frames, s + done, &mut chunk[..n])
            .map_err(|_| Error::Inval)?;
        ctx.console.write_bytes(&chunk[..n]);
        done += n;
    }
    Ok(0)
}

fn sys_cgetc(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.console.read_byte().map_or(0, usize::from))
}

fn sys_getenvid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(usize::from(ctx.caller()?))
}

fn sys_env_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let caller = ctx.caller()?;
    let target = ctx.resolve(args.get(0))?;
    if target == caller {
        log_info!(target: "env", "[{}] exiting gracefully", caller);
    } else {
        log_info!(target: "env", "[{}] destroying {}", caller, target);
    }
    ctx.envs.destroy(target, ctx.frames);
    if target == caller {
        Err(Stop::Exit)
    } else {
        Ok(0)
    }
}

fn sys_page_alloc(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageAllocArgsTyped::decode(args);
    let target = ctx.resolve(typed.env)?;
    let (va, perm) = typed.check()?;
    let space = space_of_mut(ctx.envs, target)?;
    let frame = ctx.frames.alloc(true)?;
    if let Err(err) = space.map(ctx.frames, va, frame, perm) {
        ctx.frames.free(frame);
        return Err(err.into());
    }
    Ok(0)
}

fn sys_page_map(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageMapArgsTyped::decode(args);
    let src = ctx.resolve(typed.src)?;
    let dst = ctx.resolve(typed.dst)?;
    let (srcva, dstva, perm) = typed.check()?;
    let pte = space_of(ctx.envs, src)?.lookup(srcva.raw()).ok_or(Error::Inval)?;
    if perm.contains(PteFlags::WRITABLE) && !pte.permits(PteFlags::WRITABLE) {
        return Err(Error::Inval.into());
    }
    space_of_mut(ctx.envs, dst)?.map(ctx.frames, dstva, pte.frame, perm)?;
    Ok(0)
}

fn sys_page_unmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = ctx.resolve(args.get(0))?;
    let va = user_page(args.get(1))?;
    space_of_mut(ctx.envs, target)?.unmap(ctx.frames, va);
    Ok(0)
}

fn sys_exofork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let caller = ctx.caller()?;
    let frame = *ctx.envs.get(caller).ok_or(Error::BadEnv)?.frame();
    let child = ctx.envs.alloc(Some(caller), ctx.frames)?;
    if let Some(env) = ctx.envs.get_mut(child) {
        let tf = env.frame_mut();
        *tf = frame;
        tf.regs.eax = 0;
    }
    log_debug!(target: "env", "[{}] exofork -> {}", caller, child);
    Ok(usize::from(child))
}

fn sys_env_set_status(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SetStatusArgsTyped::decode(args);
    let target = ctx.resolve(typed.env)?;
    let status = typed.check()?;
    let env = ctx.envs.get_mut(target).ok_or(Error::BadEnv)?;
    // A running caller stays Running; NotRunnable takes effect at the next reschedule.
    if !(env.status() == EnvStatus::Running && status == EnvStatus::Runnable) {
        env.set_status(status);
    }
    Ok(0)
}

fn sys_env_set_trapframe(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let caller = ctx.caller()?;
    let target = ctx.resolve(args.get(0))?;
    let tf_va = args.get(1);
    user_mem_assert(ctx.envs, ctx.frames, caller, tf_va, TrapFrame::SIZE, PteFlags::USER)?;
    let mut raw = [0u8; TrapFrame::SIZE];
    space_of(ctx.envs, caller)?
        .copy_from_user(ctx.frames, tf_va, &mut raw)
        .map_err(|_| Error::Inval)?;
    let mut tf = TrapFrame::from_bytes(&raw);
    tf.sanitize();
    *ctx.envs.get_mut(target).ok_or(Error::BadEnv)?.frame_mut() = tf;
    Ok(0)
}

fn sys_env_set_pgfault_upcall(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = ctx.resolve(args.get(0))?;
    let func = args.get(1);
    // Not validated here; a bad entry point surfaces when a fault is delivered.
    let entry = (func != 0).then_some(func);
    ctx.envs.get_mut(target).ok_or(Error::BadEnv)?.set_pgfault_upcall(entry);
    Ok(0)
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let caller = ctx.caller()?;
    if let Some(env) = ctx.envs.get_mut(caller) {
        env.frame_mut().regs.eax = 0;
    }
    Err(Stop::Block)
}

fn sys_ipc_try_send(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let caller = ctx.caller()?;
    ipc::try_send(
        ctx.envs,
        ctx.frames,
        caller,
        env_word(args.get(0))?,
        args.get(1) as u32,
        args.get(2),
        args.get(3),
    )?;
    Ok(0)
}

fn sys_ipc_recv(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let caller = ctx.caller()?;
    ipc::recv(ctx.envs, caller, args.get(0))?;
    Err(Stop::Block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::BufferConsole;
    use crate::mm::USER_TOP;

    struct Harness {
        envs: EnvTable,
        frames: Frames,
        console: BufferConsole,
        table: SyscallTable,
    }

    impl Harness {
        fn new(envs: usize, frames: usize) -> Self {
            let mut table = SyscallTable::new();
            install_handlers(&mut table);
            Self {
                envs: EnvTable::new(envs),
                frames: Frames::new(frames),
                console: BufferConsole::new(),
                table,
            }
        }

        fn spawn_running(&mut self) -> EnvId {
            let id = self.envs.alloc(None, &self.frames).unwrap();
            self.envs.get_mut(id).unwrap().set_status(EnvStatus::Runnable);
            assert!(self.envs.run(id));
            id
        }

        fn call(&mut self, number: usize, regs: [usize; 5]) -> SysResult<usize> {
            let mut console = self.console.clone();
            let mut ctx = Context::new(&mut self.envs, &self.frames, &mut console);
            self.table.dispatch(number, &mut ctx, &Args::new(regs))
        }
    }

    fn err(e: Error) -> SysResult<usize> {
        Err(Stop::Error(e))
    }

    const RW: usize = 0x7;
    const RO: usize = 0x5;

    #[test]
    fn unknown_numbers_are_inval() {
        let mut h = Harness::new(2, 16);
        h.spawn_running();
        assert_eq!(h.call(14, [0; 5]), Err(Stop::Error(Error::Inval)));
        assert_eq!(h.call(usize::MAX, [0; 5]), Err(Stop::Error(Error::Inval)));
    }

    #[test]
    fn page_alloc_checks_follow_resolution() {
        let mut h = Harness::new(2, 16);
        h.spawn_running();
        assert_eq!(h.call(SYS_PAGE_ALLOC, [0x7ff, 0x1001, RW, 0, 0]), err(Error::BadEnv));
        assert_eq!(h.call(SYS_PAGE_ALLOC, [0, 0x1001, RW, 0, 0]), err(Error::Inval));
        assert_eq!(h.call(SYS_PAGE_ALLOC, [0, USER_TOP, RW, 0, 0]), err(Error::Inval));
        assert_eq!(h.call(SYS_PAGE_ALLOC, [0, 0x1000, 0x3, 0, 0]), err(Error::Inval));
        assert_eq!(h.call(SYS_PAGE_ALLOC, [0, 0x1000, RW | 0x10, 0, 0]), err(Error::Inval));
        assert_eq!(h.call(SYS_PAGE_ALLOC, [0, 0x1000, RW, 0, 0]), Ok(0));
    }

    #[test]
    fn page_alloc_rolls_back_frame_when_table_growth_fails() {
        // root (1) + one free frame: the page allocates, its leaf table cannot.
        let mut h = Harness::new(1, 2);
        h.spawn_running();
        assert_eq!(h.frames.available(), 1);
        assert_eq!(h.call(SYS_PAGE_ALLOC, [0, 0x1000, RW, 0, 0]), err(Error::NoMem));
        assert_eq!(h.frames.available(), 1);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn page_alloc_reports_exhausted_pool() {
        let mut h = Harness::new(1, 16);
        let id = h.spawn_running();
        let before = h.frames.live();
        h.frames.deny_next_alloc();
        assert_eq!(h.call(SYS_PAGE_ALLOC, [0, 0x1000, RW, 0, 0]), err(Error::NoMem));
        assert_eq!(h.frames.live(), before);
        assert_eq!(h.envs.get(id).unwrap().space().unwrap().mapping_count(), 0);
    }

    #[test]
    fn page_map_needs_source_mapping_and_no_write_escalation() {
        let mut h = Harness::new(2, 16);
        h.spawn_running();
        assert_eq!(h.call(SYS_PAGE_MAP, [0, 0x1000, 0, 0x2000, RO]), err(Error::Inval));
        h.call(SYS_PAGE_ALLOC, [0, 0x1000, RO, 0, 0]).unwrap();
        assert_eq!(h.call(SYS_PAGE_MAP, [0, 0x1000, 0, 0x2000, RW]), err(Error::Inval));
        assert_eq!(h.call(SYS_PAGE_MAP, [0, 0x1000, 0, 0x2000, RO]), Ok(0));
    }

    #[test]
    fn page_map_without_table_frame_changes_nothing() {
        // root + leaf + page exhaust the pool; 0x40_0000 needs a second leaf.
        let mut h = Harness::new(1, 3);
        let id = h.spawn_running();
        h.call(SYS_PAGE_ALLOC, [0, 0x1000, RO, 0, 0]).unwrap();
        assert_eq!(h.frames.available(), 0);
        let src = h.envs.get(id).unwrap().space().unwrap().lookup(0x1000).unwrap();

        assert_eq!(h.call(SYS_PAGE_MAP, [0, 0x1000, 0, 0x0040_0000, RO]), err(Error::NoMem));
        let space = h.envs.get(id).unwrap().space().unwrap();
        assert_eq!(space.lookup(0x0040_0000), None);
        assert_eq!(space.table_frames(), 2);
        assert_eq!(h.frames.refcount(src.frame), 1);
        assert_eq!(h.frames.live(), 3);
    }

    #[test]
    fn exofork_without_root_frame_returns_slot() {
        let mut h = Harness::new(2, 1);
        h.spawn_running();
        assert_eq!(h.call(SYS_EXOFORK, [0; 5]), err(Error::NoMem));
        assert_eq!(h.envs.live_count(), 1);
        assert_eq!(h.frames.live(), 1);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn exofork_retry_after_no_mem_keeps_generation() {
        let mut h = Harness::new(2, 16);
        h.spawn_running();
        h.frames.deny_next_alloc();
        assert_eq!(h.call(SYS_EXOFORK, [0; 5]), err(Error::NoMem));
        let child = EnvId::from_raw(h.call(SYS_EXOFORK, [0; 5]).unwrap() as u32);
        assert_eq!((child.index(), child.generation()), (1, 1));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn wide_env_words_do_not_alias_self() {
        let mut h = Harness::new(2, 16);
        let id = h.spawn_running();
        let wide = 1usize << 32;
        assert_eq!(h.call(SYS_ENV_DESTROY, [wide, 0, 0, 0, 0]), err(Error::BadEnv));
        assert_eq!(h.call(SYS_PAGE_ALLOC, [wide, 0x1000, RW, 0, 0]), err(Error::BadEnv));
        assert_eq!(h.call(SYS_IPC_TRY_SEND, [wide, 1, USER_TOP, 0, 0]), err(Error::BadEnv));
        let aliased = wide | id.as_raw() as usize;
        assert_eq!(h.call(SYS_ENV_SET_PGFAULT_UPCALL, [aliased, 0x1000, 0, 0, 0]), err(Error::BadEnv));
        assert!(h.envs.get(id).is_some());
        assert_eq!(h.envs.get(id).unwrap().pgfault_upcall(), None);
    }

    #[test]
    fn set_status_only_accepts_runnable_states() {
        let mut h = Harness::new(2, 16);
        h.spawn_running();
        let child = h.call(SYS_EXOFORK, [0; 5]).unwrap();
        assert_eq!(h.call(SYS_ENV_SET_STATUS, [child, 3, 0, 0, 0]), err(Error::Inval));
        assert_eq!(h.call(SYS_ENV_SET_STATUS, [child, 0, 0, 0, 0]), err(Error::Inval));
        assert_eq!(h.call(SYS_ENV_SET_STATUS, [child, 2, 0, 0, 0]), Ok(0));
        let child = EnvId::from_raw(child as u32);
        assert_eq!(h.envs.get(child).unwrap().status(), EnvStatus::Runnable);
    }

    #[test]
    fn cputs_writes_validated_bytes() {
        let mut h = Harness::new(1, 16);
        let id = h.spawn_running();
        h.call(SYS_PAGE_ALLOC, [0, 0x1000, RW, 0, 0]).unwrap();
        let space = h.envs.get(id).unwrap().space().unwrap();
        space.copy_to_user(&h.frames, 0x1ffe, b"hi").unwrap();
        assert_eq!(h.call(SYS_CPUTS, [0x1ffe, 2, 0, 0, 0]), Ok(0));
        assert_eq!(h.console.output(), b"hi");
    }

    #[test]
    fn cgetc_returns_zero_without_input() {
        let mut h = Harness::new(1, 16);
        h.spawn_running();
        assert_eq!(h.call(SYS_CGETC, [0; 5]), Ok(0));
        h.console.push_input(b"q");
        assert_eq!(h.call(SYS_CGETC, [0; 5]), Ok(b'q' as usize));
    }

    #[test]
    fn null_upcall_clears_registration() {
        let mut h = Harness::new(1, 16);
        let id = h.spawn_running();
        h.call(SYS_ENV_SET_PGFAULT_UPCALL, [0, 0x0080_0100, 0, 0, 0]).unwrap();
        assert_eq!(h.envs.get(id).unwrap().pgfault_upcall(), Some(0x0080_0100));
        h.call(SYS_ENV_SET_PGFAULT_UPCALL, [0, 0, 0, 0, 0]).unwrap();
        assert_eq!(h.envs.get(id).unwrap().pgfault_upcall(), None);
    }
}
