// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the address-space syscalls
//! OWNERS: @kernel-team
//! NOTE: Tests only; drives the public dispatcher through `Kernel::syscall`.
//!
//! TEST_SCOPE:
//!   - page_alloc hands out zeroed pages and never leaks on replacement
//!   - page_map never escalates write access
//!   - page_unmap idempotence
//!
//! TEST_SCENARIOS:
//!   - page_alloc_yields_zeroed_page(): fresh mapping reads back as zeros even on recycled frames
//!   - realloc_releases_previous_frame(): remapping drops one reference and grows live by <= 1
//!   - write_escalation_is_rejected(): WRITABLE over a read-only source is INVAL with no mutation
//!   - unmap_twice_succeeds(): second unmap also returns 0 and leaves no mapping

use super::{Args, Disposition, SYS_PAGE_ALLOC, SYS_PAGE_MAP, SYS_PAGE_UNMAP};
use crate::env::EnvId;
use crate::hal::BufferConsole;
use crate::kernel::Kernel;
use crate::mm::{PAGE_SIZE, USER_TOP};
use crate::KernelConfig;
use alloc::vec;
use proptest::prelude::*;

const P: usize = 0x1;
const W: usize = 0x2;
const U: usize = 0x4;
const AVAIL: usize = 0xe00;

fn booted() -> (Kernel, EnvId) {
    let config = KernelConfig::default().with_env_capacity(4).with_frame_capacity(64);
    let mut kernel = Kernel::new(config, BufferConsole::new());
    let id = kernel.create_env(None).unwrap();
    kernel.run(id).unwrap();
    (kernel, id)
}

fn arb_page() -> impl Strategy<Value = usize> {
    (0usize..USER_TOP / PAGE_SIZE).prop_map(|n| n * PAGE_SIZE)
}

fn arb_perm() -> impl Strategy<Value = usize> {
    (any::<bool>(), 0usize..8).prop_map(|(w, avail)| {
        let write = if w { W } else { 0 };
        P | U | write | ((avail << 9) & AVAIL)
    })
}

fn call(kernel: &mut Kernel, number: usize, regs: [usize; 5]) -> Disposition {
    kernel.syscall(number, Args::new(regs))
}

proptest! {
    #[test]
    fn page_alloc_yields_zeroed_page(va in arb_page(), perm in arb_perm(), junk in any::<u8>()) {
        let (mut kernel, id) = booted();
        // Dirty a frame and release it so the pool may recycle it.
        prop_assert_eq!(call(&mut kernel, SYS_PAGE_ALLOC, [0, va, P | U | W, 0, 0]), Disposition::Return(0));
        kernel.copy_to_user(id, va, &vec![junk; PAGE_SIZE]).unwrap();
        prop_assert_eq!(call(&mut kernel, SYS_PAGE_UNMAP, [0, va, 0, 0, 0]), Disposition::Return(0));

        prop_assert_eq!(call(&mut kernel, SYS_PAGE_ALLOC, [0, va, perm, 0, 0]), Disposition::Return(0));
        let mut buf = vec![0xffu8; PAGE_SIZE];
        kernel.copy_from_user(id, va, &mut buf).unwrap();
        prop_assert!(buf.iter().all(|b| *b == 0));
        let pte = kernel.env(id).unwrap().space().unwrap().lookup(va).unwrap();
        prop_assert_eq!(pte.flags.bits() as usize, perm);
    }

    #[test]
    fn realloc_releases_previous_frame(va in arb_page(), perm in arb_perm()) {
        let (mut kernel, id) = booted();
        call(&mut kernel, SYS_PAGE_ALLOC, [0, va, perm, 0, 0]);
        let old = kernel.env(id).unwrap().space().unwrap().lookup(va).unwrap().frame;
        // Share the frame so it survives the replacement and its count is observable.
        let other = va ^ (1 << 22);
        prop_assume!(other < USER_TOP);
        call(&mut kernel, SYS_PAGE_MAP, [0, va, 0, other, P | U]);
        prop_assert_eq!(kernel.frames().refcount(old), 2);

        let live = kernel.frames().live();
        prop_assert_eq!(call(&mut kernel, SYS_PAGE_ALLOC, [0, va, perm, 0, 0]), Disposition::Return(0));
        prop_assert_eq!(kernel.frames().refcount(old), 1);
        prop_assert!(kernel.frames().live() <= live + 1);
    }

    #[test]
    fn write_escalation_is_rejected(src in arb_page(), dst in arb_page(), avail in 0usize..8) {
        let (mut kernel, id) = booted();
        let ro = P | U | ((avail << 9) & AVAIL);
        call(&mut kernel, SYS_PAGE_ALLOC, [0, src, ro, 0, 0]);
        let before = kernel.env(id).unwrap().space().unwrap().lookup(dst);
        let live = kernel.frames().live();

        prop_assert_eq!(call(&mut kernel, SYS_PAGE_MAP, [0, src, 0, dst, ro | W]), Disposition::Return(-3));
        prop_assert_eq!(kernel.env(id).unwrap().space().unwrap().lookup(dst), before);
        prop_assert_eq!(kernel.frames().live(), live);
    }

    #[test]
    fn unmap_twice_succeeds(va in arb_page(), mapped in any::<bool>()) {
        let (mut kernel, id) = booted();
        if mapped {
            call(&mut kernel, SYS_PAGE_ALLOC, [0, va, P | U, 0, 0]);
        }
        let baseline = kernel.frames().live();
        prop_assert_eq!(call(&mut kernel, SYS_PAGE_UNMAP, [0, va, 0, 0, 0]), Disposition::Return(0));
        let after_first = kernel.frames().live();
        prop_assert_eq!(call(&mut kernel, SYS_PAGE_UNMAP, [0, va, 0, 0, 0]), Disposition::Return(0));
        prop_assert_eq!(kernel.frames().live(), after_first);
        prop_assert!(after_first <= baseline);
        let space = kernel.env(id).unwrap().space().unwrap();
        prop_assert!(space.lookup(va).is_none());
        prop_assert!(space.mappings().all(|(page, _)| page.raw() != va));
    }
}
