// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Contracts of the external subsystems the boot sequence drives.
//!
//! Paging, the allocator, interrupt controllers, the scheduler etc. live
//! elsewhere; all the orchestrator knows about them is the init/ready
//! contract below. Secondary cores call into some of them concurrently during
//! bring-up, hence every contract is `Sync`.

use core::alloc::GlobalAlloc;

use crate::coreboot::ApEntry;
use crate::coreboot::BringupContext;
use crate::error::SubsystemError;
use crate::percore::{CoreDescriptor, CoreId, HwId};
use crate::system::GlobalSystemState;
use crate::workload::Workload;

/// Result of a collaborator's init contract.
pub type SubsystemResult<T = ()> = Result<T, SubsystemError>;

/// What the bootloader hands over at entry.
///
/// We don't parse the structure behind `pointer`, it's forwarded to the paging
/// subsystem as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    pub pointer: u64,
    pub magic: u32,
}

/// What the paging subsystem reports after initialization, needed to wire up
/// the allocator and to enable translation on secondary cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingState {
    /// Physical address of the root page-table.
    pub root: u64,
}

/// Console/output; diagnostics before this is up are lost.
pub trait Console: Sync {
    /// Brings up the output channel and logging with the given log filter.
    fn init_console(&self, log_filter: &str) -> SubsystemResult;
}

/// Processor features and control.
pub trait Cpu: Sync {
    /// Makes sure the machine supports what we require.
    fn detect_features(&self) -> SubsystemResult;

    /// The non-returning idle loop of the boot core.
    fn idle(&self) -> !;

    /// Stops the calling core after a fatal error.
    fn halt(&self) -> !;
}

pub trait Interrupts: Sync {
    fn install_vector_table(&self) -> SubsystemResult;

    /// Initializes the interrupt controller(s) of `core` (local and, on the
    /// boot core, the I/O controller).
    fn init_controller(&self, core: &CoreDescriptor) -> SubsystemResult;

    /// Unmask interrupts on the calling core.
    fn unmask(&self);

    /// Mask interrupts on the calling core.
    fn mask(&self);
}

pub trait Paging: Sync {
    /// Sets up paging from what the bootloader handed over.
    fn init_paging(&self, boot_info: BootInfo) -> SubsystemResult<PagingState>;

    /// Enables address translation on a freshly woken secondary core.
    fn enable_local(&self, state: &PagingState, core: &CoreDescriptor) -> SubsystemResult;
}

pub trait Allocator: Sync {
    /// Wires the allocator to paging; dynamic allocation works afterwards.
    fn install_hooks(&self, paging: &PagingState) -> SubsystemResult;

    /// The heap early boot allocations come from.
    fn heap(&self) -> &'static dyn GlobalAlloc;
}

pub trait Topology: Sync {
    /// Number of processors in the system (early, cheap probe).
    fn early_count(&self) -> usize;

    /// Logical id of the processor we boot on.
    fn boot_core(&self) -> CoreId;

    /// Hardware id (e.g., APIC id) of a logical core.
    fn hardware_id(&self, core: CoreId) -> HwId;

    /// Detailed topology discovery (caches, NUMA nodes, siblings).
    fn full_discover(&self, core: &CoreDescriptor) -> SubsystemResult;
}

pub trait Fpu: Sync {
    fn init_fpu(&self, core: &CoreDescriptor) -> SubsystemResult;
}

pub trait Random: Sync {
    fn seed(&self, core: &CoreDescriptor) -> SubsystemResult;
}

pub trait Scheduler: Sync {
    fn init_scheduler(&self) -> SubsystemResult;

    /// Steady-state scheduling on `core`, entered after the core barrier.
    ///
    /// Doesn't return on hardware. Hosted implementations may return, which
    /// retires the core.
    fn run(&self, system: &GlobalSystemState, core: &CoreDescriptor);
}

/// Cross-processor function calls.
pub trait CrossCall: Sync {
    fn arm(&self, core: &CoreDescriptor) -> SubsystemResult;
}

/// Optional profiling support.
pub trait Instrumentation: Sync {
    fn init_instrumentation(&self) -> SubsystemResult;
    fn start(&self);
    fn calibrate(&self);
    fn end(&self);
    fn report(&self);
}

/// Optional runtime support for non-core code (static constructors etc.).
pub trait LanguageRuntime: Sync {
    fn init_runtime(&self) -> SubsystemResult;
}

/// The platform's inter-processor wake-up mechanism.
pub trait Wake: Sync {
    /// Starts `core` executing `entry(ctx, core.id())`.
    fn wake(
        &self,
        core: &CoreDescriptor,
        entry: ApEntry,
        ctx: &'static BringupContext,
    ) -> SubsystemResult;
}

/// Handles to every collaborator of the boot sequence.
#[derive(Clone, Copy)]
pub struct Subsystems {
    pub console: &'static dyn Console,
    pub cpu: &'static dyn Cpu,
    pub interrupts: &'static dyn Interrupts,
    pub paging: &'static dyn Paging,
    pub allocator: &'static dyn Allocator,
    pub topology: &'static dyn Topology,
    pub fpu: &'static dyn Fpu,
    pub random: &'static dyn Random,
    pub scheduler: &'static dyn Scheduler,
    pub xcall: &'static dyn CrossCall,
    pub wake: &'static dyn Wake,
    pub instrumentation: Option<&'static dyn Instrumentation>,
    pub runtime: Option<&'static dyn LanguageRuntime>,
    pub workloads: &'static [&'static dyn Workload],
}

impl Subsystems {
    /// Uses `platform` for every mandatory collaborator; no optional ones and
    /// no workloads.
    pub fn uniform<P>(platform: &'static P) -> Subsystems
    where
        P: Console
            + Cpu
            + Interrupts
            + Paging
            + Allocator
            + Topology
            + Fpu
            + Random
            + Scheduler
            + CrossCall
            + Wake
            + 'static,
    {
        Subsystems {
            console: platform,
            cpu: platform,
            interrupts: platform,
            paging: platform,
            allocator: platform,
            topology: platform,
            fpu: platform,
            random: platform,
            scheduler: platform,
            xcall: platform,
            wake: platform,
            instrumentation: None,
            runtime: None,
            workloads: &[],
        }
    }

    pub fn with_instrumentation(mut self, i: &'static dyn Instrumentation) -> Subsystems {
        self.instrumentation = Some(i);
        self
    }

    pub fn with_runtime(mut self, rt: &'static dyn LanguageRuntime) -> Subsystems {
        self.runtime = Some(rt);
        self
    }

    pub fn with_workloads(mut self, workloads: &'static [&'static dyn Workload]) -> Subsystems {
        self.workloads = workloads;
        self
    }
}
