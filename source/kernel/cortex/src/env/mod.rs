// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Environment table and lifecycle helpers
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (alloc/destroy/generations) + integration scenarios
//! PUBLIC API: EnvTable (alloc/destroy/get/run), Env, EnvId, EnvStatus, EnvError
//! DEPENDS_ON: mm::{AddressSpace, Frames}, ipc::IpcState, trap::TrapFrame
//! INVARIANTS: space.is_some() <=> status != Free; generation bumped on every destroy;
//!             at most one environment Running (the table's `current`)

extern crate alloc;

use alloc::vec::Vec;

use crate::ipc::IpcState;
use crate::mm::{AddressSpace, Frames};
use crate::trap::TrapFrame;
use crate::types::next_generation;

pub use crate::types::{EnvId, ENV_INDEX_BITS};

/// Scheduling state of an environment slot. Discriminants are ABI values.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    Running = 3,
    NotRunnable = 4,
}

impl EnvStatus {
    pub fn from_raw(raw: usize) -> Option<Self> {
        Some(match raw {
            0 => Self::Free,
            1 => Self::Dying,
            2 => Self::Runnable,
            3 => Self::Running,
            4 => Self::NotRunnable,
            _ => return None,
        })
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Errors produced while allocating environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvError {
    /// Every slot is in use.
    NoFreeEnv,
    /// The address-space root frame could not be allocated.
    NoMem,
}

/// One environment slot.
pub struct Env {
    id: EnvId,
    parent: Option<EnvId>,
    status: EnvStatus,
    space: Option<AddressSpace>,
    frame: TrapFrame,
    pgfault_upcall: Option<usize>,
    pub(crate) ipc: IpcState,
    runs: u32,
}

impl Env {
    fn vacant(index: usize) -> Self {
        Self {
            id: EnvId::compose(index, 1),
            parent: None,
            status: EnvStatus::Free,
            space: None,
            frame: TrapFrame::default(),
            pgfault_upcall: None,
            ipc: IpcState::default(),
            runs: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// Creator of this environment; authority checks consult only this link.
    #[inline]
    pub fn parent(&self) -> Option<EnvId> {
        self.parent
    }

    #[inline]
    pub fn status(&self) -> EnvStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: EnvStatus) {
        self.status = status;
    }

    pub fn is_live(&self) -> bool {
        self.status != EnvStatus::Free
    }

    pub fn space(&self) -> Option<&AddressSpace> {
        self.space.as_ref()
    }

    pub fn space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.space.as_mut()
    }

    /// Saved user context.
    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    pub fn pgfault_upcall(&self) -> Option<usize> {
        self.pgfault_upcall
    }

    pub(crate) fn set_pgfault_upcall(&mut self, entry: Option<usize>) {
        self.pgfault_upcall = entry;
    }

    pub fn ipc(&self) -> &IpcState {
        &self.ipc
    }

    /// Number of times the environment has been switched to.
    pub fn runs(&self) -> u32 {
        self.runs
    }
}

/// Fixed-capacity arena of environments with a LIFO free list.
pub struct EnvTable {
    slots: Vec<Env>,
    free: Vec<usize>,
    current: Option<EnvId>,
}

impl EnvTable {
    /// Creates `capacity` free slots; slot 0 is handed out first.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(Env::vacant).collect(),
            free: (0..capacity).rev().collect(),
            current: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots not in the free state.
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Environment currently running, if any.
    #[inline]
    pub fn current(&self) -> Option<EnvId> {
        self.current
    }

    /// Slot at `index` regardless of state.
    pub fn slot(&self, index: usize) -> Option<&Env> {
        self.slots.get(index)
    }

    /// Live environment named by `id`; stale generations yield `None`.
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.slots.get(id.index()).filter(|env| env.is_live() && env.id == id)
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.slots.get_mut(id.index()).filter(|env| env.is_live() && env.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Env> + '_ {
        self.slots.iter().filter(|env| env.is_live())
    }

    /// Takes a free slot and gives it an empty address space and an initial
    /// user context. The new environment starts `NotRunnable`.
    pub fn alloc(&mut self, parent: Option<EnvId>, frames: &Frames) -> Result<EnvId, EnvError> {
        let index = self.free.pop().ok_or(EnvError::NoFreeEnv)?;
        let space = match AddressSpace::new(frames) {
            Ok(space) => space,
            Err(_) => {
                self.free.push(index);
                return Err(EnvError::NoMem);
            }
        };
        let env = &mut self.slots[index];
        env.parent = parent;
        env.status = EnvStatus::NotRunnable;
        env.space = Some(space);
        env.frame = TrapFrame::user_initial();
        env.pgfault_upcall = None;
        env.ipc = IpcState::default();
        env.runs = 0;
        log_debug!(target: "env", "new env {} (parent {:?})", env.id, parent.map(u32::from));
        Ok(env.id)
    }

    /// Releases everything `id` owns and returns its slot to the free list.
    ///
    /// Stale or free ids are ignored.
    pub fn destroy(&mut self, id: EnvId, frames: &Frames) {
        let current = self.current;
        let Some(env) = self.get_mut(id) else {
            return;
        };
        if let Some(space) = env.space.take() {
            space.destroy(frames);
        }
        env.status = EnvStatus::Free;
        env.parent = None;
        env.pgfault_upcall = None;
        env.ipc = IpcState::default();
        env.id = EnvId::compose(id.index(), next_generation(id.generation()));
        self.free.push(id.index());
        log_info!(target: "env", "[{:08x}] free env {}", current.map_or(0, u32::from), id);
        if current == Some(id) {
            self.current = None;
        }
    }

    /// Makes `id` the running environment, demoting the previous one to runnable.
    ///
    /// Returns `false` unless `id` is live and either runnable or already running.
    pub(crate) fn run(&mut self, id: EnvId) -> bool {
        match self.get(id).map(Env::status) {
            Some(EnvStatus::Runnable) | Some(EnvStatus::Running) => {}
            _ => return false,
        }
        if let Some(prev) = self.current.filter(|prev| *prev != id) {
            if let Some(env) = self.get_mut(prev) {
                if env.status == EnvStatus::Running {
                    env.status = EnvStatus::Runnable;
                }
            }
        }
        self.current = Some(id);
        if let Some(env) = self.get_mut(id) {
            env.status = EnvStatus::Running;
            env.runs = env.runs.saturating_add(1);
        }
        true
    }

    /// Clears the running environment (nothing runnable).
    pub(crate) fn idle(&mut self) {
        if let Some(prev) = self.current.take() {
            if let Some(env) = self.get_mut(prev) {
                if env.status == EnvStatus::Running {
                    env.status = EnvStatus::Runnable;
                }
            }
        }
    }
}
