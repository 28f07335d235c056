// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A reusable N-party rendezvous for cores.
//!
//! This is used before any lock, scheduler or wait-queue exists, so waiting
//! means spinning (with `arch::relax` in the loop). The only thing we need from
//! the rest of the system is a heap to place the counters on.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use log::trace;

use crate::arch;
use crate::error::{ConfigError, KResult};
use crate::heap;

/// Counters shared by all participants.
///
/// `arrived` and `generation` live on separate cache-lines: every arrival
/// hammers `arrived` while the waiters spin on `generation`.
struct BarrierState {
    threshold: usize,
    arrived: CachePadded<AtomicUsize>,
    generation: CachePadded<AtomicUsize>,
}

/// A sense-reversing (generation counting) spin barrier for `threshold` cores.
///
/// The `threshold`-th arrival of a round resets the arrival count and advances
/// the generation; everyone else spins until they observe the generation they
/// arrived in change. A context can therefore never be released by a round
/// it didn't take part in, and the barrier is ready for the next round as
/// soon as the previous one released.
///
/// All writes a participant performs before `wait` are visible to every other
/// participant once their `wait` returns.
pub struct CoreBarrier {
    state: NonNull<BarrierState>,
    heap: &'static dyn GlobalAlloc,
}

// Safe: `BarrierState` only contains atomics (and an immutable threshold).
unsafe impl Send for CoreBarrier {}
unsafe impl Sync for CoreBarrier {}

static_assertions::assert_impl_all!(CoreBarrier: Send, Sync);

impl CoreBarrier {
    /// Allocates a barrier for `threshold` participants from `heap`.
    ///
    /// Fails with a `ConfigError` for a threshold of zero and with
    /// `OutOfMemory` if `heap` can't provide the backing storage; in both
    /// cases nothing is left allocated.
    pub fn init(threshold: usize, heap: &'static dyn GlobalAlloc) -> KResult<CoreBarrier> {
        if threshold < 1 {
            return Err(ConfigError::BarrierThreshold { threshold }.into());
        }

        let state = heap::try_alloc::<BarrierState>(heap)?;
        unsafe {
            // Safe: fresh allocation with the right layout.
            ptr::write(
                state.as_ptr(),
                BarrierState {
                    threshold,
                    arrived: CachePadded::new(AtomicUsize::new(0)),
                    generation: CachePadded::new(AtomicUsize::new(0)),
                },
            );
        }
        trace!("CoreBarrier for {} cores at {:p}", threshold, state);

        Ok(CoreBarrier { state, heap })
    }

    fn state(&self) -> &BarrierState {
        // Safe: initialized in `init`, freed only in `drop`.
        unsafe { self.state.as_ref() }
    }

    /// Blocks until `threshold` contexts called `wait` for the current round.
    ///
    /// Returns `true` for exactly one participant per round (the one whose
    /// arrival completed it).
    ///
    /// # Notes
    /// Exactly `threshold` distinct contexts must call this per round. An
    /// extra caller corrupts the round and a missing one blocks everyone
    /// forever: there is no timeout.
    pub fn wait(&self) -> bool {
        let state = self.state();
        let generation = state.generation.load(Ordering::Acquire);
        let arrived = state.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(
            arrived <= state.threshold,
            "More than {} arrivals in generation {}",
            state.threshold,
            generation
        );

        if arrived == state.threshold {
            // Must be reset before the release: a released core may arrive
            // for the next round right away.
            state.arrived.store(0, Ordering::Relaxed);
            state.generation.fetch_add(1, Ordering::Release);
            true
        } else {
            while state.generation.load(Ordering::Acquire) == generation {
                arch::relax();
            }
            false
        }
    }

    /// Number of participants per round.
    pub fn threshold(&self) -> usize {
        self.state().threshold
    }

    /// Number of participants waiting in the current round.
    pub fn arrived(&self) -> usize {
        self.state().arrived.load(Ordering::Acquire)
    }

    /// Number of completed rounds.
    pub fn generation(&self) -> usize {
        self.state().generation.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CoreBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreBarrier")
            .field("threshold", &self.threshold())
            .field("arrived", &self.arrived())
            .field("generation", &self.generation())
            .finish()
    }
}

impl Drop for CoreBarrier {
    fn drop(&mut self) {
        debug_assert_eq!(self.arrived(), 0, "Dropping CoreBarrier with waiters");
        unsafe {
            // Safe: we own the allocation and nobody waits on it anymore.
            ptr::drop_in_place(self.state.as_ptr());
            self.heap
                .dealloc(self.state.as_ptr() as *mut u8, Layout::new::<BarrierState>());
        }
    }
}
