// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The process-wide record of the machine we booted on.

use core::alloc::GlobalAlloc;

use log::debug;

use crate::barrier::CoreBarrier;
use crate::error::KResult;
use crate::heap;
use crate::percore::{CoreId, PerCoreAreaRegistry};

/// Created once by the boot core and never destroyed.
///
/// All fields are written before any secondary core is woken up, and only
/// read afterwards, so sharing a `&'static` is all the synchronization this
/// needs.
#[derive(Debug)]
pub struct GlobalSystemState {
    num_cores: usize,
    boot_core: CoreId,
    barrier: CoreBarrier,
    registry: PerCoreAreaRegistry,
}

impl GlobalSystemState {
    /// Sizes the core barrier to the number of cores in `registry` and
    /// allocates the system state, both from `heap`.
    pub fn create(
        heap: &'static dyn GlobalAlloc,
        registry: PerCoreAreaRegistry,
    ) -> KResult<&'static GlobalSystemState> {
        let num_cores = registry.len();
        let barrier = CoreBarrier::init(num_cores, heap)?;
        let system = heap::try_leak(
            heap,
            GlobalSystemState {
                num_cores,
                boot_core: registry.boot_core(),
                barrier,
                registry,
            },
        )?;
        debug!(
            "System state for {} cores (boot core {}) at {:p}",
            system.num_cores, system.boot_core, system
        );

        Ok(system)
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    pub fn boot_core(&self) -> CoreId {
        self.boot_core
    }

    pub fn barrier(&self) -> &CoreBarrier {
        &self.barrier
    }

    pub fn registry(&self) -> &PerCoreAreaRegistry {
        &self.registry
    }
}

static_assertions::assert_impl_all!(GlobalSystemState: Send, Sync);
