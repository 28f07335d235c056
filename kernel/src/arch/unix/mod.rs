// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Hosted backend: runs the boot sequence as a normal process.
//!
//! Every core is an OS thread, the per-core register is a thread-local and
//! waking a core spawns a thread. Used for testing the boot logic without
//! hardware.

pub mod coreboot;
pub mod debug;
pub mod machine;
pub mod percore;

/// Upper bound on the number of cores we boot.
pub const MAX_CORES: usize = 256;

/// Called in the body of spin-loops.
pub fn relax() {
    std::thread::yield_now();
}
