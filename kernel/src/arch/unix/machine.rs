// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A simulated machine implementing every collaborator of the boot sequence.
//!
//! Calls are recorded as `Event`s so tests can check what ran, on which core
//! and in what order. Failures can be injected into individual phases, into
//! the local initialization or wake-up of a core and into the heap.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::System;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info};
use spin::Mutex;

use crate::coreboot::{ApEntry, BringupContext};
use crate::error::SubsystemError;
use crate::percore::{CoreDescriptor, CoreId, HwId};
use crate::phase::BootPhase;
use crate::subsystems::*;
use crate::system::GlobalSystemState;

/// Something that happened on the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A collaborator ran the init contract of `phase` on the boot core.
    Boot(BootPhase),
    /// A secondary core ran the local part of `phase`.
    Local { core: CoreId, phase: BootPhase },
    /// The boot core woke up a secondary core.
    Wake(CoreId),
    /// A secondary core entered the scheduler; `all_at_barrier` tells
    /// whether every core had reached the barrier at that point.
    Running { core: CoreId, all_at_barrier: bool },
    Unmasked,
    Masked,
    ProfileStart,
    ProfileCalibrate,
    ProfileEnd,
    ProfileReport,
    /// A workload ran.
    Workload(&'static str),
    Idle,
    Halt,
}

/// Forwards to the system allocator until its budget is used up.
struct FaultyHeap {
    budget: Option<usize>,
    allocations: AtomicUsize,
}

unsafe impl GlobalAlloc for FaultyHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let n = self.allocations.fetch_add(1, Ordering::Relaxed);
        match self.budget {
            Some(budget) if n >= budget => core::ptr::null_mut(),
            _ => System.alloc(layout),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

/// Describes the machine to simulate.
#[derive(Debug, Clone, Copy)]
pub struct MachineBuilder {
    cores: usize,
    boot_core: CoreId,
    fail_phase: Option<BootPhase>,
    fail_local_init: Option<CoreId>,
    fail_wake: Option<CoreId>,
    heap_budget: Option<usize>,
}

impl MachineBuilder {
    /// Boot on core `core` instead of core 0.
    pub fn boot_core(mut self, core: CoreId) -> Self {
        self.boot_core = core;
        self
    }

    /// Let the collaborator of `phase` fail on the boot core.
    pub fn fail_phase(mut self, phase: BootPhase) -> Self {
        self.fail_phase = Some(phase);
        self
    }

    /// Let the local interrupt controller init of secondary `core` fail.
    pub fn fail_local_init(mut self, core: CoreId) -> Self {
        self.fail_local_init = Some(core);
        self
    }

    /// Let waking up `core` fail.
    pub fn fail_wake(mut self, core: CoreId) -> Self {
        self.fail_wake = Some(core);
        self
    }

    /// Let the heap fail every allocation after the first `allocations`.
    pub fn heap_budget(mut self, allocations: usize) -> Self {
        self.heap_budget = Some(allocations);
        self
    }

    pub fn build(self) -> &'static HostedMachine {
        let heap: &'static FaultyHeap = Box::leak(Box::new(FaultyHeap {
            budget: self.heap_budget,
            allocations: AtomicUsize::new(0),
        }));
        Box::leak(Box::new(HostedMachine {
            config: self,
            heap,
            events: Mutex::new(Vec::new()),
            secondaries: Mutex::new(Vec::new()),
            context: Mutex::new(None),
        }))
    }
}

/// A simulated machine, see the module documentation.
pub struct HostedMachine {
    config: MachineBuilder,
    heap: &'static FaultyHeap,
    events: Mutex<Vec<Event>>,
    secondaries: Mutex<Vec<JoinHandle<()>>>,
    context: Mutex<Option<&'static BringupContext>>,
}

impl HostedMachine {
    /// Starts describing a machine with `cores` cores.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(cores: usize) -> MachineBuilder {
        MachineBuilder {
            cores,
            boot_core: 0,
            fail_phase: None,
            fail_local_init: None,
            fail_wake: None,
            heap_budget: None,
        }
    }

    /// What a bootloader would hand us.
    pub fn boot_info(&self) -> BootInfo {
        BootInfo {
            pointer: 0x1000,
            magic: 0x36d7_6289,
        }
    }

    /// All mandatory collaborators, plus instrumentation and the language
    /// runtime.
    pub fn subsystems(&'static self) -> Subsystems {
        Subsystems::uniform(self)
            .with_instrumentation(self)
            .with_runtime(self)
    }

    pub fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    /// A snapshot of everything that happened so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Polls the event log until `pred` holds for it; gives up after
    /// `timeout`.
    pub fn wait_for<F>(&self, pred: F, timeout: Duration) -> bool
    where
        F: Fn(&[Event]) -> bool,
    {
        let start = Instant::now();
        loop {
            if pred(&self.events.lock()) {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// The system state secondary cores were woken up with (if any).
    pub fn system(&self) -> Option<&'static GlobalSystemState> {
        self.context.lock().map(|ctx| ctx.system())
    }

    /// Waits for the threads of all woken-up secondary cores to finish.
    pub fn join_secondaries(&self) {
        let handles: Vec<JoinHandle<()>> = self.secondaries.lock().drain(..).collect();
        for h in handles {
            let _r = h.join();
        }
    }

    fn injected(&self, phase: BootPhase) -> SubsystemResult {
        if self.config.fail_phase == Some(phase) {
            Err(SubsystemError::new("injected failure"))
        } else {
            Ok(())
        }
    }

    /// Records `phase` for `core` and fails if asked to.
    fn on_core(&self, core: &CoreDescriptor, phase: BootPhase) -> SubsystemResult {
        if core.is_boot() {
            self.injected(phase)?;
            self.record(Event::Boot(phase));
        } else {
            if self.config.fail_local_init == Some(core.id())
                && phase == BootPhase::InterruptController
            {
                return Err(SubsystemError::new("injected local failure"));
            }
            self.record(Event::Local {
                core: core.id(),
                phase,
            });
        }
        Ok(())
    }

    fn on_boot(&self, phase: BootPhase) -> SubsystemResult {
        self.injected(phase)?;
        self.record(Event::Boot(phase));
        Ok(())
    }

    fn park(&self, event: Event) -> ! {
        self.record(event);
        loop {
            thread::park();
        }
    }
}

impl Console for HostedMachine {
    fn init_console(&self, log_filter: &str) -> SubsystemResult {
        debug!("Hosted console, log filter is '{}'", log_filter);
        self.on_boot(BootPhase::Console)
    }
}

impl Cpu for HostedMachine {
    fn detect_features(&self) -> SubsystemResult {
        self.on_boot(BootPhase::CpuFeatures)
    }

    fn idle(&self) -> ! {
        self.park(Event::Idle)
    }

    fn halt(&self) -> ! {
        self.park(Event::Halt)
    }
}

impl Interrupts for HostedMachine {
    fn install_vector_table(&self) -> SubsystemResult {
        self.on_boot(BootPhase::VectorTable)
    }

    fn init_controller(&self, core: &CoreDescriptor) -> SubsystemResult {
        self.on_core(core, BootPhase::InterruptController)
    }

    fn unmask(&self) {
        self.record(Event::Unmasked);
    }

    fn mask(&self) {
        self.record(Event::Masked);
    }
}

impl Paging for HostedMachine {
    fn init_paging(&self, boot_info: BootInfo) -> SubsystemResult<PagingState> {
        self.on_boot(BootPhase::Paging)?;
        Ok(PagingState {
            root: boot_info.pointer,
        })
    }

    fn enable_local(&self, _state: &PagingState, core: &CoreDescriptor) -> SubsystemResult {
        self.on_core(core, BootPhase::Paging)
    }
}

impl Allocator for HostedMachine {
    fn install_hooks(&self, _paging: &PagingState) -> SubsystemResult {
        self.on_boot(BootPhase::AllocatorHooks)
    }

    fn heap(&self) -> &'static dyn GlobalAlloc {
        self.heap
    }
}

impl Topology for HostedMachine {
    fn early_count(&self) -> usize {
        self.record(Event::Boot(BootPhase::EarlyTopology));
        self.config.cores
    }

    fn boot_core(&self) -> CoreId {
        self.config.boot_core
    }

    fn hardware_id(&self, core: CoreId) -> HwId {
        (core * 2) as HwId
    }

    fn full_discover(&self, core: &CoreDescriptor) -> SubsystemResult {
        self.on_core(core, BootPhase::Topology)
    }
}

impl Fpu for HostedMachine {
    fn init_fpu(&self, core: &CoreDescriptor) -> SubsystemResult {
        self.on_core(core, BootPhase::Fpu)
    }
}

impl Random for HostedMachine {
    fn seed(&self, core: &CoreDescriptor) -> SubsystemResult {
        self.on_core(core, BootPhase::Random)
    }
}

impl Scheduler for HostedMachine {
    fn init_scheduler(&self) -> SubsystemResult {
        self.on_boot(BootPhase::Scheduler)
    }

    fn run(&self, system: &GlobalSystemState, core: &CoreDescriptor) {
        let all_at_barrier = system
            .registry()
            .iter()
            .all(|a| a.descriptor().state().has_reached_barrier());
        self.record(Event::Running {
            core: core.id(),
            all_at_barrier,
        });
    }
}

impl CrossCall for HostedMachine {
    fn arm(&self, core: &CoreDescriptor) -> SubsystemResult {
        self.on_core(core, BootPhase::CrossCall)
    }
}

impl Instrumentation for HostedMachine {
    fn init_instrumentation(&self) -> SubsystemResult {
        self.on_boot(BootPhase::Instrumentation)
    }

    fn start(&self) {
        self.record(Event::ProfileStart);
    }

    fn calibrate(&self) {
        self.record(Event::ProfileCalibrate);
    }

    fn end(&self) {
        self.record(Event::ProfileEnd);
    }

    fn report(&self) {
        info!("{} events recorded", self.events.lock().len());
        self.record(Event::ProfileReport);
    }
}

impl LanguageRuntime for HostedMachine {
    fn init_runtime(&self) -> SubsystemResult {
        self.on_boot(BootPhase::LanguageRuntime)
    }
}

impl Wake for HostedMachine {
    fn wake(
        &self,
        core: &CoreDescriptor,
        entry: ApEntry,
        ctx: &'static BringupContext,
    ) -> SubsystemResult {
        if self.config.fail_wake == Some(core.id()) {
            *self.context.lock() = Some(ctx);
            return Err(SubsystemError::new("injected wake failure"));
        }
        self.record(Event::Wake(core.id()));
        *self.context.lock() = Some(ctx);
        let handle = super::coreboot::initialize(core.id(), entry, ctx)?;
        self.secondaries.lock().push(handle);
        Ok(())
    }
}
