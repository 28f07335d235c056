// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Starting "cores" in a hosted environment.

use std::thread::{self, JoinHandle};

use crate::coreboot::{ApEntry, BringupContext};
use crate::error::SubsystemError;
use crate::percore::CoreId;

/// Starts up the core identified by `core_id` on a fresh thread, it begins
/// executing in `entry` with `ctx`.
pub fn initialize(
    core_id: CoreId,
    entry: ApEntry,
    ctx: &'static BringupContext,
) -> Result<JoinHandle<()>, SubsystemError> {
    thread::Builder::new()
        .name(format!("core-{}", core_id))
        .spawn(move || entry(ctx, core_id))
        .map_err(|_| SubsystemError::new("can't spawn thread for core"))
}
