// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for environment id resolution
//! OWNERS: @kernel-cap-team
//! NOTE: Tests only; no kernel logic. Ensures ids never alias across slot reuse.
//!
//! TEST_SCOPE:
//!   - Stale ids after any number of destroy/alloc cycles
//!   - Authority: only self and direct children resolve under SelfOrParent
//!
//! TEST_SCENARIOS:
//!   - stale_ids_never_resolve(): every destroyed id stays unresolvable after reuse
//!   - authority_matches_parent_link(): SelfOrParent succeeds iff parent == caller or id == caller

use super::{Authority, CapError};
use crate::env::{EnvId, EnvStatus, EnvTable};
use crate::mm::Frames;
use alloc::vec::Vec;
use proptest::prelude::*;

proptest! {
    #[test]
    fn stale_ids_never_resolve(cycles in 1usize..40, slots in 1usize..6) {
        let frames = Frames::new(64);
        let mut envs = EnvTable::new(slots);
        let mut dead: Vec<EnvId> = Vec::new();
        for _ in 0..cycles {
            let id = envs.alloc(None, &frames).unwrap();
            envs.destroy(id, &frames);
            dead.push(id);
        }
        let live = envs.alloc(None, &frames).unwrap();
        for id in dead {
            prop_assert_ne!(id, live);
            prop_assert_eq!(envs.resolve(id.as_raw(), Authority::Any), Err(CapError::Stale));
        }
        prop_assert_eq!(envs.resolve(live.as_raw(), Authority::Any), Ok(live));
    }

    #[test]
    fn authority_matches_parent_link(parents in proptest::collection::vec(any::<Option<prop::sample::Index>>(), 1..8)) {
        let frames = Frames::new(64);
        let mut envs = EnvTable::new(8);
        let mut ids: Vec<EnvId> = Vec::new();
        for parent in parents {
            let parent = match parent {
                Some(ix) if !ids.is_empty() => Some(ids[ix.index(ids.len())]),
                _ => None,
            };
            ids.push(envs.alloc(parent, &frames).unwrap());
        }
        let caller = ids[0];
        envs.get_mut(caller).unwrap().set_status(EnvStatus::Runnable);
        prop_assert!(envs.run(caller));
        for &id in &ids {
            let expected = id == caller || envs.get(id).unwrap().parent() == Some(caller);
            let got = envs.resolve(id.as_raw(), Authority::SelfOrParent);
            if expected {
                prop_assert_eq!(got, Ok(id));
            } else {
                prop_assert_eq!(got, Err(CapError::Denied));
            }
        }
    }
}
