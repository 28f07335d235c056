// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A set of integration tests to ensure the boot sequence behaves as expected.
//! These tests boot a simulated machine (`HostedMachine`) where every core is
//! a thread, and check the recorded events, the phase trace and the core
//! states.
//!
//! The orchestrator always runs on a fresh thread: the per-core register is a
//! thread-local and a failing bring-up blocks the boot core forever.

use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use smpboot::arch::machine::{Event, HostedMachine};
use smpboot::error::ConfigError;
use smpboot::percore::CoreState;
use smpboot::phase::{BootPhase, PhaseTrace};
use smpboot::system::GlobalSystemState;
use smpboot::workload::Workload;
use smpboot::{BootConfig, BootOrchestrator, KError, KResult};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Runs phases 1-19 on `machine` and waits for the outcome.
fn boot(machine: &'static HostedMachine, config: BootConfig) -> (KResult<usize>, PhaseTrace) {
    thread::spawn(move || {
        let mut orchestrator = BootOrchestrator::new(config, machine.boot_info(), machine.subsystems());
        let r = orchestrator.execute_phases().map(|s| s.num_cores());
        (r, orchestrator.trace().clone())
    })
    .join()
    .unwrap()
}

/// Starts the full boot sequence (including idle/halt) on `machine` and
/// leaves it running.
fn boot_detached(machine: &'static HostedMachine, config: BootConfig) {
    thread::spawn(move || {
        BootOrchestrator::new(config, machine.boot_info(), machine.subsystems()).run();
    });
}

/// Polls `pred` until it holds or we run out of patience.
fn eventually<F: Fn() -> bool>(pred: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn position(events: &[Event], e: Event) -> Option<usize> {
    events.iter().position(|x| *x == e)
}

fn state(system: &GlobalSystemState, core: usize) -> CoreState {
    system.registry().get(core).unwrap().descriptor().state()
}

/// Every core reaches `Running`, and none of them got there before all cores
/// had arrived at the barrier.
#[test]
fn s00_bringup_four_cores() {
    let _r = env_logger::try_init();
    let machine = HostedMachine::new(4).build();

    let (r, trace) = boot(machine, BootConfig::default());
    assert_eq!(r, Ok(4));
    machine.join_secondaries();

    let events = machine.events();
    for core in 1..4 {
        assert!(events.contains(&Event::Wake(core)));
        assert!(events.contains(&Event::Running {
            core,
            all_at_barrier: true
        }));
        for phase in [BootPhase::Paging, BootPhase::InterruptController, BootPhase::Fpu] {
            assert!(events.contains(&Event::Local { core, phase }));
        }
    }
    assert!(!events.contains(&Event::Wake(0)));

    let system = machine.system().unwrap();
    assert_eq!(system.num_cores(), 4);
    assert_eq!(system.barrier().generation(), 1);
    assert_eq!(system.barrier().arrived(), 0);
    for core in 0..4 {
        assert_eq!(state(system, core), CoreState::Running);
    }
    assert!(trace.is_linear_extension());
}

/// The boot core doesn't have to be core 0.
#[test]
fn s00_bringup_from_other_core() {
    let _r = env_logger::try_init();
    let machine = HostedMachine::new(3).boot_core(2).build();

    let (r, _trace) = boot(machine, BootConfig::default());
    assert_eq!(r, Ok(3));
    machine.join_secondaries();

    let events = machine.events();
    assert!(events.contains(&Event::Wake(0)));
    assert!(events.contains(&Event::Wake(1)));
    assert!(!events.contains(&Event::Wake(2)));
    let system = machine.system().unwrap();
    assert_eq!(system.boot_core(), 2);
    assert!(system.registry().boot_area().descriptor().is_boot());
    assert_eq!(system.registry().get(1).unwrap().descriptor().hw_id(), 2);
}

/// A core failing its local initialization halts, never arrives at the
/// barrier, and so nobody ever gets to run.
#[test]
fn s00_local_init_failure_blocks_bringup() {
    let _r = env_logger::try_init();
    let machine = HostedMachine::new(4).fail_local_init(2).build();
    boot_detached(machine, BootConfig::default());

    assert!(eventually(|| machine
        .system()
        .map_or(false, |s| s.barrier().arrived() == 3)));
    let system = machine.system().unwrap();
    assert_eq!(state(system, 2), CoreState::HaltedError);
    assert_eq!(state(system, 0), CoreState::BarrierWait);
    assert_eq!(state(system, 1), CoreState::BarrierWait);
    assert_eq!(state(system, 3), CoreState::BarrierWait);

    // Give it some time to (wrongly) make progress.
    thread::sleep(Duration::from_millis(100));
    let events = machine.events();
    assert!(!events.iter().any(|e| matches!(e, Event::Running { .. })));
    assert!(!events.contains(&Event::Unmasked));
    assert!(!events.contains(&Event::Idle));
    assert!(!events.contains(&Event::Local {
        core: 2,
        phase: BootPhase::Fpu
    }));
    assert_eq!(system.barrier().generation(), 0);
}

/// Failing to allocate the barrier stops the sequence before the interrupt
/// controller is touched.
#[test]
fn s00_barrier_allocation_failure() {
    let _r = env_logger::try_init();
    // Enough for the four per-core areas, but not for the barrier.
    let machine = HostedMachine::new(4).heap_budget(4).build();

    let (r, trace) = boot(machine, BootConfig::default());
    assert!(matches!(r, Err(KError::OutOfMemory { .. })));
    assert_eq!(trace.last(), Some(BootPhase::BootCoreArea));
    assert!(!trace.contains(BootPhase::SystemState));

    let events = machine.events();
    assert_eq!(events.last(), Some(&Event::Boot(BootPhase::EarlyTopology)));
    assert!(!events.contains(&Event::Boot(BootPhase::InterruptController)));
    assert!(!events.iter().any(|e| matches!(e, Event::Wake(_))));
    assert!(machine.system().is_none());
}

/// `run` masks interrupts and halts after a fatal error.
#[test]
fn s00_fatal_error_halts() {
    let _r = env_logger::try_init();
    let machine = HostedMachine::new(2).heap_budget(2).build();
    boot_detached(machine, BootConfig::default());

    assert!(machine.wait_for(|events| events.contains(&Event::Halt), TIMEOUT));
    let events = machine.events();
    assert!(position(&events, Event::Masked) < position(&events, Event::Halt));
    assert!(!events.contains(&Event::Idle));
    assert!(!events.contains(&Event::Boot(BootPhase::InterruptController)));
}

/// `run` ends up in idle after the boot sequence completed.
#[test]
fn s00_run_reaches_idle() {
    let _r = env_logger::try_init();
    let machine = HostedMachine::new(2).build();
    boot_detached(machine, BootConfig::default().with_boot_marker(true));

    assert!(machine.wait_for(|events| events.contains(&Event::Idle), TIMEOUT));
    let events = machine.events();
    assert!(position(&events, Event::Unmasked) < position(&events, Event::Idle));
    assert!(!events.contains(&Event::Halt));
    assert!(!events.contains(&Event::Masked));
}

/// A failing wake-up marks the core and aborts bring-up.
#[test]
fn s00_wake_failure() {
    let _r = env_logger::try_init();
    let machine = HostedMachine::new(3).fail_wake(2).build();

    let (r, trace) = boot(machine, BootConfig::default());
    assert!(matches!(
        r,
        Err(KError::SubsystemInit {
            phase: BootPhase::SecondaryBringup,
            ..
        })
    ));
    assert_eq!(trace.last(), Some(BootPhase::Topology));

    let system = machine.system().unwrap();
    assert_eq!(state(system, 2), CoreState::HaltedError);
    assert!(!machine.events().contains(&Event::Unmasked));
}

struct Recorder(&'static HostedMachine);

impl Workload for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn run(&self, system: &GlobalSystemState) {
        assert_eq!(system.num_cores(), 2);
        self.0.record(Event::Workload(self.name()));
    }
}

fn recorder_workloads(machine: &'static HostedMachine) -> &'static [&'static dyn Workload] {
    let recorder: &'static Recorder = Box::leak(Box::new(Recorder(machine)));
    Box::leak(vec![recorder as &'static dyn Workload].into_boxed_slice())
}

/// The workload runs last, bracketed by instrumentation.
#[test]
fn s00_workload_with_instrumentation() {
    let _r = env_logger::try_init();
    let machine = HostedMachine::new(2).build();
    let subsystems = machine.subsystems().with_workloads(recorder_workloads(machine));
    let config = BootConfig::from_str("./kernel workload=recorder instrument=on runtime=on").unwrap();

    let (r, trace) = thread::spawn(move || {
        let mut orchestrator = BootOrchestrator::new(config, machine.boot_info(), subsystems);
        let r = orchestrator.execute_phases().map(|s| s.num_cores());
        (r, orchestrator.trace().clone())
    })
    .join()
    .unwrap();
    assert_eq!(r, Ok(2));
    assert!(trace.is_linear_extension());
    assert_eq!(trace.last(), Some(BootPhase::Workload));
    assert!(trace.contains(BootPhase::Instrumentation));
    assert!(trace.contains(BootPhase::LanguageRuntime));

    let events: Vec<Event> = machine
        .events()
        .into_iter()
        .filter(|e| !matches!(e, Event::Local { .. } | Event::Running { .. }))
        .collect();
    let n = events.len();
    assert_eq!(
        &events[n - 6..],
        &[
            Event::Unmasked,
            Event::ProfileStart,
            Event::ProfileCalibrate,
            Event::Workload("recorder"),
            Event::ProfileEnd,
            Event::ProfileReport,
        ]
    );
}

/// Asking for a workload we don't have fails the workload phase.
#[test]
fn s00_unknown_workload() {
    let _r = env_logger::try_init();
    let machine = HostedMachine::new(1).build();
    let (r, trace) = boot(machine, BootConfig::default().with_workload("nope"));
    assert_eq!(r, Err(KError::from(ConfigError::UnknownWorkload)));
    assert_eq!(trace.last(), Some(BootPhase::InterruptsUnmasked));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Whatever the machine looks like, the phases run in dependency order,
    /// interrupts are unmasked after the controller is up and no core is
    /// woken before the barrier exists.
    #[test]
    fn s00_ordering(cores in 1usize..6, boot_core in 0usize..6, instrument in any::<bool>(), runtime in any::<bool>()) {
        let boot_core = boot_core % cores;
        let machine = HostedMachine::new(cores).boot_core(boot_core).build();
        let config = BootConfig::default()
            .with_instrumentation(instrument)
            .with_runtime(runtime);

        let (r, trace) = boot(machine, config);
        machine.join_secondaries();
        prop_assert_eq!(r, Ok(cores));
        prop_assert!(trace.is_linear_extension());
        prop_assert_eq!(trace.contains(BootPhase::Instrumentation), instrument);
        prop_assert_eq!(trace.contains(BootPhase::LanguageRuntime), runtime);
        prop_assert!(trace.position(BootPhase::SystemState) < trace.position(BootPhase::SecondaryBringup));

        let events = machine.events();
        let controller = position(&events, Event::Boot(BootPhase::InterruptController));
        let unmasked = position(&events, Event::Unmasked);
        prop_assert!(controller.is_some());
        prop_assert!(controller < unmasked);
        let armed = position(&events, Event::Boot(BootPhase::CrossCall));
        for (idx, e) in events.iter().enumerate() {
            if let Event::Wake(core) = e {
                prop_assert_ne!(*core, boot_core);
                prop_assert!(armed < Some(idx));
            }
        }
        let running = events.iter().filter(|e| matches!(e, Event::Running { all_at_barrier: true, .. })).count();
        prop_assert_eq!(running, cores - 1);
    }
}
