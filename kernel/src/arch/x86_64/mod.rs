// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bare-metal x86-64 backend.
//!
//! Provides the per-core register (`gs`), a serial console, the QEMU exit
//! device and waking up cores with INIT/STARTUP IPIs. Everything else the
//! boot sequence needs (paging, APIC drivers, the scheduler...) is plugged in
//! through the contracts in `subsystems`.

pub mod coreboot;
pub mod cpu;
pub mod debug;
pub mod percore;

/// Upper bound on the number of cores we boot.
pub const MAX_CORES: usize = 256;

/// Called in the body of spin-loops.
pub fn relax() {
    core::hint::spin_loop();
}

/// Stops the calling core for good.
pub fn halt() -> ! {
    unsafe {
        x86::irq::disable();
    }
    loop {
        unsafe { x86::halt() };
    }
}
