// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cold-boot sequencing and SMP bring-up for a bare-metal kernel.
//!
//! `boot::BootOrchestrator` takes the boot core from the bootloader handoff
//! through a fixed sequence of phases (`phase::BootPhase`) to idle. Along the
//! way it sets up the per-core areas (`percore`), the core barrier
//! (`barrier`) and wakes up the secondary cores (`coreboot`). Paging, the
//! allocator, interrupt controllers, the scheduler etc. are collaborators
//! behind the traits in `subsystems`.
//!
//! On `target_os = "none"` (x86-64) the crate is `no_std`; on unix it runs
//! hosted, with threads standing in for cores (see `arch::machine`).

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[path = "arch/x86_64/mod.rs"]
pub mod arch;

#[cfg(target_family = "unix")]
#[path = "arch/unix/mod.rs"]
pub mod arch;

pub mod barrier;
pub mod boot;
pub mod cmdline;
pub mod coreboot;
pub mod error;
pub mod heap;
pub mod percore;
pub mod phase;
pub mod subsystems;
pub mod system;
pub mod workload;

pub use crate::boot::BootOrchestrator;
pub use crate::cmdline::BootConfig;
pub use crate::error::{KError, KResult};
