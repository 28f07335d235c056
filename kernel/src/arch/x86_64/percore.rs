// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-core register is the `gs` base of the core.

use x86::msr::{rdmsr, wrmsr, IA32_GS_BASE, IA32_KERNEL_GSBASE};

use crate::percore::PerCoreArea;

/// Try to retrieve the area of the calling core by reading the gs base.
///
/// We go through the MSR instead of `rdgsbase` since the latter needs
/// FSGSBASE support enabled in `cr4`, which happens late or not at all.
pub fn read_register() -> *const PerCoreArea {
    unsafe { rdmsr(IA32_GS_BASE) as *const PerCoreArea }
}

/// Installs the area by setting the gs base to point to it.
///
/// We also set IA32_KERNEL_GSBASE to the same pointer to make sure when
/// `swapgs` runs on an interrupt or syscall entry we end up with the area
/// again.
///
/// # Safety
/// `area` has to stay valid for as long as the core runs.
pub unsafe fn write_register(area: *const PerCoreArea) {
    wrmsr(IA32_GS_BASE, area as u64);
    wrmsr(IA32_KERNEL_GSBASE, area as u64);
}
