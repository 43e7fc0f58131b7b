// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time sizing knobs for the kernel tables
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig (default/with_env_capacity/with_frame_capacity), MAX_ENVS
//! INVARIANTS: env capacity fits the id index bits; values fixed after Kernel::new

use crate::env::ENV_INDEX_BITS;

/// Upper bound on environment slots imposed by the id encoding.
pub const MAX_ENVS: usize = 1 << ENV_INDEX_BITS;

const DEFAULT_FRAMES: usize = 16 * 1024; // 64 MiB of simulated physical memory

/// Sizing of the environment table and the physical frame pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    env_capacity: usize,
    frame_capacity: usize,
}

impl KernelConfig {
    /// Overrides the number of environment slots, clamped to `1..=MAX_ENVS`.
    pub fn with_env_capacity(mut self, slots: usize) -> Self {
        self.env_capacity = slots.clamp(1, MAX_ENVS);
        self
    }

    /// Overrides the number of physical frames available to the allocator.
    pub fn with_frame_capacity(mut self, frames: usize) -> Self {
        self.frame_capacity = frames;
        self
    }

    pub fn env_capacity(&self) -> usize {
        self.env_capacity
    }

    pub fn frame_capacity(&self) -> usize {
        self.frame_capacity
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { env_capacity: MAX_ENVS, frame_capacity: DEFAULT_FRAMES }
    }
}
