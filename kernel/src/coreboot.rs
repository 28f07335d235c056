// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bring-up of the secondary (non-boot) cores.
//!
//! The boot core wakes every secondary core with the platform's wake
//! mechanism. Each of them runs `ap_main`, which does the minimal core-local
//! initialization and then waits on the core barrier. The boot core waits on
//! the same barrier, so nobody enters steady-state scheduling before every
//! core finished its local initialization.
//!
//! # Notes
//! A secondary core that fails its local initialization halts and never
//! arrives at the barrier. Nothing reports this back to the boot core, so
//! everyone else blocks forever (there is no timeout on the barrier).

use log::{debug, error, info};

use crate::error::{KError, KResult};
use crate::percore::{CoreId, CoreState, PerCoreArea};
use crate::phase::BootPhase;
use crate::subsystems::{PagingState, Subsystems};
use crate::system::GlobalSystemState;

/// Entry point of a secondary core, invoked by the wake mechanism.
pub type ApEntry = fn(&'static BringupContext, CoreId);

/// Everything a secondary core needs to initialize itself.
///
/// Shared by all secondary cores and only ever read.
pub struct BringupContext {
    system: &'static GlobalSystemState,
    subsystems: Subsystems,
    paging: PagingState,
}

impl BringupContext {
    pub fn new(
        system: &'static GlobalSystemState,
        subsystems: Subsystems,
        paging: PagingState,
    ) -> BringupContext {
        BringupContext {
            system,
            subsystems,
            paging,
        }
    }

    pub fn system(&self) -> &'static GlobalSystemState {
        self.system
    }

    pub fn subsystems(&self) -> &Subsystems {
        &self.subsystems
    }

    pub fn paging(&self) -> &PagingState {
        &self.paging
    }
}

/// Wakes the secondary cores and rendezvous with them.
pub struct SecondaryBringupController {
    ctx: &'static BringupContext,
}

impl SecondaryBringupController {
    pub fn new(ctx: &'static BringupContext) -> SecondaryBringupController {
        SecondaryBringupController { ctx }
    }

    /// Wakes every secondary core, then waits on the core barrier with them.
    ///
    /// Must be called once, on the boot core, after the scheduler and
    /// cross-calls are set up there. Returns once all cores passed the
    /// barrier, or blocks forever if one of them halted.
    pub fn bring_up_all(&self) -> KResult<()> {
        let system = self.ctx.system;
        let wake = self.ctx.subsystems.wake;

        for area in system.registry().iter() {
            let core = area.descriptor();
            if core.is_boot() {
                continue;
            }

            debug!("Waking up core {} (hw id {})", core.id(), core.hw_id());
            core.set_state(CoreState::StartupRequested);
            if let Err(source) = wake.wake(core, ap_main, self.ctx) {
                core.set_state(CoreState::HaltedError);
                return Err(KError::SubsystemInit {
                    phase: BootPhase::SecondaryBringup,
                    source,
                });
            }
        }

        let boot = system.registry().boot_area().descriptor();
        boot.set_state(CoreState::BarrierWait);
        system.barrier().wait();
        boot.set_state(CoreState::Running);
        info!("All {} cores passed the core barrier", system.num_cores());

        Ok(())
    }
}

/// Runs on a freshly woken secondary core.
///
/// Returns only if the core halted during local initialization, or once the
/// scheduler gave the core up (hosted execution).
pub fn ap_main(ctx: &'static BringupContext, id: CoreId) {
    let area = match ctx.system.registry().get(id) {
        Some(area) => area,
        None => {
            error!("Woke up core {} which we don't know about", id);
            return;
        }
    };
    let core = area.descriptor();

    core.set_state(CoreState::LocalInit);
    if let Err(e) = local_init(ctx, area) {
        core.set_state(CoreState::HaltedError);
        // Best-effort: logging might not work from here.
        error!("{} ({})", KError::Halted { core: id }, e);
        return;
    }

    core.set_state(CoreState::BarrierWait);
    ctx.system.barrier().wait();
    core.set_state(CoreState::Running);

    ctx.subsystems.scheduler.run(ctx.system, core);
}

/// The core-local part of initialization, in the order it has to happen.
fn local_init(ctx: &BringupContext, area: &'static PerCoreArea) -> KResult<()> {
    let core = area.descriptor();
    let subsystems = &ctx.subsystems;

    subsystems
        .paging
        .enable_local(&ctx.paging, core)
        .map_err(KError::subsystem(BootPhase::Paging))?;
    ctx.system.registry().register_self(area)?;
    subsystems
        .interrupts
        .init_controller(core)
        .map_err(KError::subsystem(BootPhase::InterruptController))?;
    subsystems
        .fpu
        .init_fpu(core)
        .map_err(KError::subsystem(BootPhase::Fpu))?;

    debug!("Core {} finished local initialization", core.id());
    Ok(())
}
