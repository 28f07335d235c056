// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The cold-boot sequence of the boot core.
//!
//! `BootOrchestrator` walks through the phases in `BootPhase` order, calling
//! into the collaborator responsible for each of them. Every failure is fatal:
//! the remaining phases are skipped and nothing that already ran is undone.

use log::{debug, error, info, trace, warn};

use crate::arch;
use crate::cmdline::BootConfig;
use crate::coreboot::{BringupContext, SecondaryBringupController};
use crate::error::{KError, KResult};
use crate::heap;
use crate::percore::{CoreState, PerCoreArea, PerCoreAreaRegistry};
use crate::phase::{self, BootPhase, PhaseTrace};
use crate::subsystems::{BootInfo, Subsystems};
use crate::system::GlobalSystemState;
use crate::workload;

/// Drives the boot core from the bootloader handoff to idle.
pub struct BootOrchestrator {
    config: BootConfig,
    boot_info: BootInfo,
    subsystems: Subsystems,
    trace: PhaseTrace,
    failed: Option<BootPhase>,
    system: Option<&'static GlobalSystemState>,
}

impl BootOrchestrator {
    pub fn new(config: BootConfig, boot_info: BootInfo, subsystems: Subsystems) -> BootOrchestrator {
        BootOrchestrator {
            config,
            boot_info,
            subsystems,
            trace: PhaseTrace::new(),
            failed: None,
            system: None,
        }
    }

    /// The phases that completed so far.
    pub fn trace(&self) -> &PhaseTrace {
        &self.trace
    }

    /// The phase that failed, if any.
    pub fn failed_phase(&self) -> Option<BootPhase> {
        self.failed
    }

    /// The system state, once it was created.
    pub fn system(&self) -> Option<&'static GlobalSystemState> {
        self.system
    }

    /// Runs the boot sequence and ends up in the idle loop of the boot core.
    ///
    /// On failure interrupts are masked, the error is reported and the core
    /// halts.
    pub fn run(mut self) -> ! {
        match self.execute_phases() {
            Ok(_) => {
                phase::set_current_phase(BootPhase::Idle);
                debug_assert!(self.trace.satisfies(BootPhase::Idle));
                self.trace.record(BootPhase::Idle);
                self.subsystems.cpu.idle()
            }
            Err(e) => {
                self.subsystems.interrupts.mask();
                match self.failed {
                    Some(p) => error!("Boot failed during '{}': {}", p, e),
                    None => error!("Boot failed: {}", e),
                }
                self.subsystems.cpu.halt()
            }
        }
    }

    /// Runs phases 1 to 19 and returns the system state.
    ///
    /// Stops at the first failing phase. After it returned successfully, the
    /// caller is expected to become the idle loop (see `run`).
    pub fn execute_phases(&mut self) -> KResult<&'static GlobalSystemState> {
        let s = self.subsystems;
        let config = self.config;
        let boot_info = self.boot_info;

        if config.boot_marker {
            arch::debug::boot_marker();
        }

        self.step(BootPhase::Console, || {
            s.console
                .init_console(config.log_filter)
                .map_err(KError::subsystem(BootPhase::Console))
        })?;
        self.step(BootPhase::VectorTable, || {
            s.interrupts
                .install_vector_table()
                .map_err(KError::subsystem(BootPhase::VectorTable))
        })?;
        self.step(BootPhase::CpuFeatures, || {
            s.cpu
                .detect_features()
                .map_err(KError::subsystem(BootPhase::CpuFeatures))
        })?;
        let paging = self.step(BootPhase::Paging, || {
            s.paging
                .init_paging(boot_info)
                .map_err(KError::subsystem(BootPhase::Paging))
        })?;
        self.step(BootPhase::AllocatorHooks, || {
            s.allocator
                .install_hooks(&paging)
                .map_err(KError::subsystem(BootPhase::AllocatorHooks))
        })?;
        let heap = s.allocator.heap();

        let (count, boot_core) = self.step(BootPhase::EarlyTopology, || {
            let count = s.topology.early_count();
            let boot_core = s.topology.boot_core();
            debug!("Early probe found {} cores, booting on {}", count, boot_core);
            Ok((count, boot_core))
        })?;
        let boot_area = self.step(BootPhase::BootCoreArea, || {
            let area = PerCoreArea::allocate(heap, boot_core, s.topology.hardware_id(boot_core), true)?;
            area.register()?;
            area.descriptor().set_state(CoreState::LocalInit);
            Ok(area)
        })?;
        let system = self.step(BootPhase::SystemState, || {
            let registry =
                PerCoreAreaRegistry::complete(heap, count, boot_area, |id| s.topology.hardware_id(id))?;
            GlobalSystemState::create(heap, registry)
        })?;
        self.system = Some(system);
        let boot = system.registry().boot_area().descriptor();

        self.step(BootPhase::InterruptController, || {
            s.interrupts
                .init_controller(boot)
                .map_err(KError::subsystem(BootPhase::InterruptController))
        })?;
        self.step(BootPhase::Fpu, || {
            s.fpu
                .init_fpu(boot)
                .map_err(KError::subsystem(BootPhase::Fpu))
        })?;
        self.step(BootPhase::Random, || {
            s.random
                .seed(boot)
                .map_err(KError::subsystem(BootPhase::Random))
        })?;
        self.step(BootPhase::Scheduler, || {
            s.scheduler
                .init_scheduler()
                .map_err(KError::subsystem(BootPhase::Scheduler))
        })?;
        self.step(BootPhase::CrossCall, || {
            s.xcall
                .arm(boot)
                .map_err(KError::subsystem(BootPhase::CrossCall))
        })?;
        self.step(BootPhase::Topology, || {
            s.topology
                .full_discover(boot)
                .map_err(KError::subsystem(BootPhase::Topology))
        })?;

        if let Some(i) = self.enabled(BootPhase::Instrumentation, config.instrument, s.instrumentation) {
            self.step(BootPhase::Instrumentation, || {
                i.init_instrumentation()
                    .map_err(KError::subsystem(BootPhase::Instrumentation))
            })?;
        }

        self.step(BootPhase::SecondaryBringup, || {
            let ctx = heap::try_leak(heap, BringupContext::new(system, s, paging))?;
            SecondaryBringupController::new(ctx).bring_up_all()
        })?;

        if let Some(rt) = self.enabled(BootPhase::LanguageRuntime, config.runtime, s.runtime) {
            self.step(BootPhase::LanguageRuntime, || {
                rt.init_runtime()
                    .map_err(KError::subsystem(BootPhase::LanguageRuntime))
            })?;
        }

        self.step(BootPhase::InterruptsUnmasked, || {
            s.interrupts.unmask();
            Ok(())
        })?;

        if let Some(name) = config.workload {
            let instrumentation = if self.trace.contains(BootPhase::Instrumentation) {
                s.instrumentation
            } else {
                None
            };
            self.step(BootPhase::Workload, || {
                let w = workload::select(s.workloads, name)?;
                workload::launch(w, system, instrumentation);
                Ok(())
            })?;
        } else {
            trace!("No workload configured");
        }

        info!(
            "Boot complete: {} cores running, boot core {}",
            system.num_cores(),
            system.boot_core()
        );
        Ok(system)
    }

    /// Runs `phase` and records it in the trace if it succeeded.
    fn step<T, F>(&mut self, phase: BootPhase, f: F) -> KResult<T>
    where
        F: FnOnce() -> KResult<T>,
    {
        phase::set_current_phase(phase);
        debug_assert!(
            self.trace.satisfies(phase),
            "Phase '{}' started before its dependencies {:?} completed",
            phase,
            phase.dependencies()
        );
        debug!("Phase {}: {}", phase as u8, phase);

        match f() {
            Ok(v) => {
                self.trace.record(phase);
                trace!("Phase {} done", phase as u8);
                Ok(v)
            }
            Err(e) => {
                error!("Phase {} ({}) failed: {}", phase as u8, phase, e);
                self.failed = Some(phase);
                Err(e)
            }
        }
    }

    /// Returns the collaborator for an optional phase if the phase is
    /// configured and we have one.
    fn enabled<T>(&self, phase: BootPhase, configured: bool, collaborator: Option<T>) -> Option<T> {
        debug_assert!(phase.is_optional());
        match (configured, collaborator) {
            (true, Some(c)) => Some(c),
            (true, None) => {
                warn!("'{}' is configured, but not supported here; skipping it", phase);
                None
            }
            (false, _) => {
                trace!("Skipping optional phase '{}'", phase);
                None
            }
        }
    }
}
