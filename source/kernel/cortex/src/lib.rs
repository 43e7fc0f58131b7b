// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: CORTEX exokernel core library
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, KernelConfig, syscall::{Args, Disposition, Error, SYS_*}, env::EnvId
//! DEPENDS_ON: bitflags, spin, static_assertions
//! INVARIANTS: One current environment; validation precedes mutation; frames refcounted
//!
//! The crate is `no_std` + `alloc` so the same code links into the boot image and runs
//! under `cargo test` on the host. Hardware collaborators (console, scheduler policy) are
//! traits with in-memory default implementations.

#![no_std]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
pub mod diag;

pub mod cap;
pub mod config;
pub mod env;
pub mod hal;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod trap;
pub mod types;

pub use config::KernelConfig;
pub use diag::log;
pub use env::{EnvId, EnvStatus};
pub use kernel::Kernel;
pub use syscall::{Args, Disposition, Error};
