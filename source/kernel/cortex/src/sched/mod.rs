// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scheduling policy seam used by the trap-exit path
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (pick_next), RoundRobin
//! DEPENDS_ON: env::EnvTable
//! INVARIANTS: A policy only chooses; the kernel performs the switch

use crate::env::{EnvId, EnvStatus, EnvTable};

/// Chooses the next environment to run.
pub trait Scheduler: Send {
    /// Returns the environment to switch to, or `None` when nothing can run.
    fn pick_next(&mut self, envs: &EnvTable) -> Option<EnvId>;
}

/// Circular scan starting just after the current environment.
///
/// The first `Runnable` slot wins; if there is none, a still-`Running` caller
/// keeps the CPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobin;

impl Scheduler for RoundRobin {
    fn pick_next(&mut self, envs: &EnvTable) -> Option<EnvId> {
        let slots = envs.capacity();
        let current = envs.current();
        let start = current.map_or(0, |id| id.index() + 1);
        let next = (0..slots)
            .map(|offset| (start + offset) % slots)
            .filter_map(|index| envs.slot(index))
            .find(|env| env.status() == EnvStatus::Runnable)
            .map(|env| env.id());
        next.or_else(|| {
            current.filter(|id| envs.get(*id).map(|env| env.status()) == Some(EnvStatus::Running))
        })
    }
}
