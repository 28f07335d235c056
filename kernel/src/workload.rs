// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Workloads launched by the boot core once bring-up completed.

use log::info;

use crate::error::{ConfigError, KResult};
use crate::subsystems::Instrumentation;
use crate::system::GlobalSystemState;

/// Something to run once every core passed the core barrier and interrupts
/// are on (a test harness, a runtime, an application...).
pub trait Workload: Sync {
    /// Name used to select the workload on the command line.
    fn name(&self) -> &'static str;

    fn run(&self, system: &GlobalSystemState);
}

/// Looks up the workload called `name`.
pub fn select(
    workloads: &[&'static dyn Workload],
    name: &str,
) -> KResult<&'static dyn Workload> {
    workloads
        .iter()
        .copied()
        .find(|w| w.name() == name)
        .ok_or_else(|| ConfigError::UnknownWorkload.into())
}

/// Runs `workload`, bracketed by instrumentation if we have it.
pub fn launch(
    workload: &dyn Workload,
    system: &GlobalSystemState,
    instrumentation: Option<&dyn Instrumentation>,
) {
    info!("Launching workload '{}'", workload.name());
    if let Some(i) = instrumentation {
        i.start();
        i.calibrate();
    }

    workload.run(system);

    if let Some(i) = instrumentation {
        i.end();
        i.report();
    }
    info!("Workload '{}' returned", workload.name());
}
