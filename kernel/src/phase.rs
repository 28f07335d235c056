// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The phases of the cold-boot sequence and their hard dependencies.
//!
//! Using a capability before the phase that initializes it has completed is
//! undefined behavior in the target subsystem, and nothing in the hardware
//! checks it for us. The dependency table in here makes those edges explicit
//! so the orchestrator can assert them and tests can check recorded traces.

use core::sync::atomic::{AtomicU8, Ordering};

use arrayvec::ArrayVec;

/// Number of phases in the boot sequence.
pub const PHASE_COUNT: usize = 20;

/// One step of the boot sequence, in the order they run on the boot core.
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BootPhase {
    /// console output ready
    Console = 1,
    /// interrupt vector table installed
    VectorTable = 2,
    /// cpu feature detection
    CpuFeatures = 3,
    /// paging initialized
    Paging = 4,
    /// allocator hooks wired to paging
    AllocatorHooks = 5,
    /// early topology probe
    EarlyTopology = 6,
    /// boot core per-core area registered
    BootCoreArea = 7,
    /// global system state and core barrier allocated
    SystemState = 8,
    /// interrupt controller initialized
    InterruptController = 9,
    /// floating-point unit initialized
    Fpu = 10,
    /// randomness seeded
    Random = 11,
    /// scheduler initialized
    Scheduler = 12,
    /// cross-processor calls armed
    CrossCall = 13,
    /// full topology discovery
    Topology = 14,
    /// instrumentation initialized
    Instrumentation = 15,
    /// secondary processor bring-up
    SecondaryBringup = 16,
    /// language runtime initialized
    LanguageRuntime = 17,
    /// interrupts unmasked
    InterruptsUnmasked = 18,
    /// workload launch
    Workload = 19,
    /// idle
    Idle = 20,
}

impl BootPhase {
    /// All phases in the order the orchestrator executes them.
    pub const ALL: [BootPhase; PHASE_COUNT] = [
        BootPhase::Console,
        BootPhase::VectorTable,
        BootPhase::CpuFeatures,
        BootPhase::Paging,
        BootPhase::AllocatorHooks,
        BootPhase::EarlyTopology,
        BootPhase::BootCoreArea,
        BootPhase::SystemState,
        BootPhase::InterruptController,
        BootPhase::Fpu,
        BootPhase::Random,
        BootPhase::Scheduler,
        BootPhase::CrossCall,
        BootPhase::Topology,
        BootPhase::Instrumentation,
        BootPhase::SecondaryBringup,
        BootPhase::LanguageRuntime,
        BootPhase::InterruptsUnmasked,
        BootPhase::Workload,
        BootPhase::Idle,
    ];

    /// Phases that must have completed before `self` may run.
    ///
    /// Only hard edges are listed; optional phases never appear as a
    /// dependency so skipping them can't invalidate a trace.
    pub fn dependencies(self) -> &'static [BootPhase] {
        use BootPhase::*;
        match self {
            Console => &[],
            VectorTable => &[Console],
            CpuFeatures => &[VectorTable],
            Paging => &[VectorTable],
            AllocatorHooks => &[Paging],
            EarlyTopology => &[AllocatorHooks],
            BootCoreArea => &[EarlyTopology],
            SystemState => &[AllocatorHooks, EarlyTopology, BootCoreArea],
            InterruptController => &[VectorTable, BootCoreArea],
            Fpu => &[CpuFeatures, BootCoreArea],
            Random => &[BootCoreArea],
            Scheduler => &[AllocatorHooks, SystemState],
            CrossCall => &[InterruptController],
            Topology => &[EarlyTopology, BootCoreArea],
            Instrumentation => &[Console],
            SecondaryBringup => &[
                EarlyTopology,
                BootCoreArea,
                SystemState,
                InterruptController,
                Fpu,
                Random,
                Scheduler,
                CrossCall,
            ],
            LanguageRuntime => &[AllocatorHooks],
            InterruptsUnmasked => &[InterruptController, SecondaryBringup],
            Workload => &[InterruptsUnmasked],
            Idle => &[InterruptsUnmasked],
        }
    }

    /// Phases that only run when configured.
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            BootPhase::Instrumentation | BootPhase::LanguageRuntime | BootPhase::Workload
        )
    }

    fn from_u8(v: u8) -> Option<BootPhase> {
        BootPhase::ALL.get((v as usize).checked_sub(1)?).copied()
    }
}

/// The phase the boot core currently executes (0 = not started).
///
/// Diagnostics only, this is never used to synchronize anything.
static CURRENT_PHASE: AtomicU8 = AtomicU8::new(0);

/// Returns the phase the boot sequence is in (if it started).
pub fn current_phase() -> Option<BootPhase> {
    BootPhase::from_u8(CURRENT_PHASE.load(Ordering::Relaxed))
}

pub(crate) fn set_current_phase(phase: BootPhase) {
    CURRENT_PHASE.store(phase as u8, Ordering::Relaxed);
}

/// Checks that `phases` is a linear extension of the dependency order: every
/// phase appears at most once and after all of its dependencies.
pub fn is_linear_extension(phases: &[BootPhase]) -> bool {
    phases.iter().enumerate().all(|(idx, phase)| {
        let earlier = &phases[..idx];
        !earlier.contains(phase) && phase.dependencies().iter().all(|d| earlier.contains(d))
    })
}

/// The phases the orchestrator completed, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseTrace {
    completed: ArrayVec<BootPhase, PHASE_COUNT>,
}

impl PhaseTrace {
    pub fn new() -> PhaseTrace {
        Default::default()
    }

    pub(crate) fn record(&mut self, phase: BootPhase) {
        debug_assert!(!self.contains(phase), "Phase {:?} ran twice", phase);
        // Can't overflow: every phase is recorded at most once.
        let _ = self.completed.try_push(phase);
    }

    pub fn contains(&self, phase: BootPhase) -> bool {
        self.completed.contains(&phase)
    }

    /// Whether every dependency of `phase` has completed.
    pub fn satisfies(&self, phase: BootPhase) -> bool {
        phase.dependencies().iter().all(|d| self.contains(*d))
    }

    pub fn position(&self, phase: BootPhase) -> Option<usize> {
        self.completed.iter().position(|p| *p == phase)
    }

    pub fn last(&self) -> Option<BootPhase> {
        self.completed.last().copied()
    }

    pub fn as_slice(&self) -> &[BootPhase] {
        self.completed.as_slice()
    }

    pub fn is_linear_extension(&self) -> bool {
        is_linear_extension(self.as_slice())
    }
}
