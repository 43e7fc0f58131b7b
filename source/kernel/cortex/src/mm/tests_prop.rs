// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for frame accounting and user range checks
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Reference counts track the number of mappings of each frame
//!   - Teardown returns the pool to its baseline
//!   - user_mem_check agrees with a page-by-page model
//!
//! TEST_SCENARIOS:
//!   - refcounts_follow_mappings(): random map/unmap sequences keep refcount == mapping count
//!   - user_mem_check_matches_model(): first fault equals the first bad page clipped to va

use super::{AddressSpace, Frames, PteFlags, PAGE_SIZE, USER_TOP};
use crate::mm::user_mem_check;
use crate::types::VirtAddr;
use alloc::vec::Vec;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Map { page: usize, frame: usize },
    Unmap { page: usize },
}

// Pages straddle two directory entries so leaf tables get created and shared.
fn arb_page() -> impl Strategy<Value = usize> {
    prop_oneof![0usize..4, 1020usize..1028]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (arb_page(), 0usize..3).prop_map(|(page, frame)| Op::Map { page, frame }),
        arb_page().prop_map(|page| Op::Unmap { page }),
    ]
}

proptest! {
    #[test]
    fn refcounts_follow_mappings(ops in proptest::collection::vec(arb_op(), 1..40)) {
        let frames = Frames::new(32);
        let mut space = AddressSpace::new(&frames).unwrap();
        let pool: Vec<_> = (0..3).map(|_| frames.alloc(true).unwrap()).collect();
        // Pin the pool so unmapping the last reference does not free it.
        for &frame in &pool {
            frames.incref(frame);
        }
        for op in ops {
            match op {
                Op::Map { page, frame } => {
                    let va = VirtAddr::user_page(page * PAGE_SIZE).unwrap();
                    space.map(&frames, va, pool[frame], PteFlags::USER_PRESENT).unwrap();
                }
                Op::Unmap { page } => {
                    space.unmap(&frames, VirtAddr::user_page(page * PAGE_SIZE).unwrap());
                }
            }
            for &frame in &pool {
                let mapped = space.mappings().filter(|(_, pte)| pte.frame == frame).count();
                prop_assert_eq!(frames.refcount(frame) as usize, mapped + 1);
            }
        }
        space.destroy(&frames);
        for &frame in &pool {
            frames.decref(frame);
        }
        prop_assert_eq!(frames.live(), 0);
    }

    #[test]
    fn user_mem_check_matches_model(
        mapped in proptest::collection::vec(any::<bool>(), 6),
        writable in proptest::collection::vec(any::<bool>(), 6),
        start in 0usize..6 * PAGE_SIZE,
        len in 0usize..4 * PAGE_SIZE,
        want_write in any::<bool>(),
    ) {
        let frames = Frames::new(16);
        let mut space = AddressSpace::new(&frames).unwrap();
        for page in 0..6 {
            if mapped[page] {
                let frame = frames.alloc(true).unwrap();
                let mut flags = PteFlags::USER_PRESENT;
                if writable[page] {
                    flags |= PteFlags::WRITABLE;
                }
                space.map(&frames, VirtAddr::user_page(page * PAGE_SIZE).unwrap(), frame, flags).unwrap();
            }
        }
        let perm = if want_write { PteFlags::WRITABLE } else { PteFlags::empty() };
        let ok = |page: usize| page < 6 && mapped[page] && (!want_write || writable[page]);
        let expected = if len == 0 {
            Ok(())
        } else {
            let first = start / PAGE_SIZE;
            let last = (start + len - 1) / PAGE_SIZE;
            match (first..=last).find(|page| !ok(*page)) {
                Some(page) => Err((page * PAGE_SIZE).max(start)),
                None => Ok(()),
            }
        };
        prop_assert!(start + len < USER_TOP);
        prop_assert_eq!(user_mem_check(&space, start, len, perm), expected);
    }
}
